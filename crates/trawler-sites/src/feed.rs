//! RSS feed decoding shared by every driver.

use chrono::{DateTime, Utc};
use url::Url;

use trawler_core::error::{DriverError, DriverResult};
use trawler_core::model::FeedItem;

use crate::parse::bytes_to_mb;

/// Decode an RSS document into candidate items, preserving feed order.
///
/// The torrent id is lifted from the guid when it is a bare identifier,
/// otherwise from an `id` query parameter of the guid or link.
///
/// # Errors
///
/// Returns [`DriverError::Parse`] when the document is not an RSS channel.
pub fn parse_feed(site_id: &str, body: &[u8]) -> DriverResult<Vec<FeedItem>> {
    let channel = rss::Channel::read_from(body).map_err(|err| DriverError::Parse {
        site: site_id.to_string(),
        detail: format!("invalid RSS document: {err}"),
    })?;

    let mut items = Vec::with_capacity(channel.items().len());
    for item in channel.items() {
        let Some(id) = item_id(item) else {
            continue;
        };
        let size_bytes = item
            .enclosure()
            .and_then(|enclosure| enclosure.length().parse::<u64>().ok());
        items.push(FeedItem {
            id,
            title: item.title().unwrap_or_default().to_string(),
            page_url: item.link().map(str::to_string),
            download_url: item
                .enclosure()
                .map(|enclosure| enclosure.url().to_string()),
            category: item
                .categories()
                .first()
                .map(|category| category.name().to_string()),
            size_mb: size_bytes.map(bytes_to_mb),
            published_at: item.pub_date().and_then(parse_pub_date),
            detail: None,
        });
    }
    Ok(items)
}

fn item_id(item: &rss::Item) -> Option<String> {
    let guid = item.guid().map(rss::Guid::value);
    if let Some(guid) = guid {
        if let Some(id) = id_from_url(guid) {
            return Some(id);
        }
        if !guid.contains("://") && !guid.trim().is_empty() {
            return Some(guid.trim().to_string());
        }
    }
    item.link().and_then(id_from_url)
}

fn id_from_url(candidate: &str) -> Option<String> {
    let url = Url::parse(candidate).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .or_else(|| {
            // Path-addressed sites put the id in the last segment.
            url.path_segments()?
                .filter(|segment| !segment.is_empty())
                .next_back()
                .filter(|segment| segment.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string)
        })
}

fn parse_pub_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>demo</title>
    <link>https://tracker.example</link>
    <description>latest torrents</description>
    <item>
      <title>M1</title>
      <link>https://tracker.example/details.php?id=101</link>
      <guid isPermaLink="false">guid-1</guid>
      <category>movies</category>
      <pubDate>Sat, 01 Jun 2024 00:00:00 +0000</pubDate>
      <enclosure url="https://tracker.example/download.php?id=101" length="67108864" type="application/x-bittorrent"/>
    </item>
    <item>
      <title>M2</title>
      <link>https://tracker.example/details.php?id=102</link>
      <guid isPermaLink="true">https://tracker.example/details.php?id=102</guid>
      <enclosure url="https://tracker.example/download.php?id=102" length="1073741824" type="application/x-bittorrent"/>
    </item>
    <item>
      <title>no id</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn decodes_items_in_feed_order() {
        let items = parse_feed("hdsky", FEED.as_bytes()).expect("feed parses");
        assert_eq!(items.len(), 2, "items without an id are dropped");

        assert_eq!(items[0].id, "guid-1");
        assert_eq!(items[0].title, "M1");
        assert_eq!(items[0].size_mb, Some(64));
        assert_eq!(items[0].category.as_deref(), Some("movies"));
        assert!(items[0].published_at.is_some());
        assert_eq!(
            items[0].download_url.as_deref(),
            Some("https://tracker.example/download.php?id=101")
        );

        assert_eq!(items[1].id, "102", "permalink guids yield the query id");
        assert_eq!(items[1].size_mb, Some(1_024));
    }

    #[test]
    fn rejects_non_rss_documents() {
        let error = parse_feed("hdsky", b"<html>not a feed</html>").unwrap_err();
        assert!(matches!(error, DriverError::Parse { .. }));
    }

    #[test]
    fn path_addressed_ids_come_from_the_last_segment() {
        assert_eq!(
            id_from_url("https://unit3d.example/torrents/4521"),
            Some("4521".to_string())
        );
        assert_eq!(id_from_url("https://unit3d.example/torrents/"), None);
        assert_eq!(id_from_url("not a url"), None);
    }
}
