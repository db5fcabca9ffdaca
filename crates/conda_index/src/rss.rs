//! Generate an RSS feed of the most recently updated packages from
//! channeldata.

use chrono::{DateTime, TimeZone, Utc};

use crate::channeldata::{ChannelData, ChannelDataPackage};

/// Feed at most this many packages.
const THRESHOLD_PACKAGES: usize = 100;

fn rfc822(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(datetime) => {
            datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
        }
        _ => String::new(),
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn push_element(out: &mut String, indent: &str, tag: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    out.push_str(indent);
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&xml_escape(text));
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

fn recent_packages(channeldata: &ChannelData) -> Vec<(&String, &ChannelDataPackage)> {
    let mut packages: Vec<_> = channeldata.packages.iter().collect();
    packages.sort_by_key(|(name, package)| {
        (std::cmp::Reverse(package.timestamp.unwrap_or(0)), name.clone())
    });
    packages.truncate(THRESHOLD_PACKAGES);
    packages
}

/// Render `rss.xml` for the channel.
pub fn render_rss(channel_name: &str, channeldata: &ChannelData, now: DateTime<Utc>) -> String {
    let packages = recent_packages(channeldata);
    let build_date = rfc822(now.timestamp());

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<rss version=\"2.0\">\n<channel>\n");
    push_element(&mut out, "  ", "title", &format!("anaconda.org/{channel_name}"));
    push_element(
        &mut out,
        "  ",
        "link",
        &format!("https://conda.anaconda.org/{channel_name}"),
    );
    push_element(
        &mut out,
        "  ",
        "description",
        &format!(
            "The most recent {} updates for {channel_name}.",
            packages.len()
        ),
    );
    push_element(&mut out, "  ", "pubDate", &build_date);
    push_element(&mut out, "  ", "lastBuildDate", &build_date);

    for (name, package) in packages {
        let subdirs: Vec<&str> = package.subdirs.iter().map(String::as_str).collect();
        let title = format!(
            "{name} {} [{}]",
            package.version.as_deref().unwrap_or(""),
            subdirs.join(", ")
        );
        out.push_str("  <item>\n");
        push_element(&mut out, "    ", "title", &title);
        push_element(
            &mut out,
            "    ",
            "description",
            package
                .description
                .as_deref()
                .or(package.summary.as_deref())
                .unwrap_or("No description."),
        );
        push_element(
            &mut out,
            "    ",
            "link",
            package.doc_url.as_deref().unwrap_or(""),
        );
        push_element(
            &mut out,
            "    ",
            "comments",
            package.dev_url.as_deref().unwrap_or(""),
        );
        push_element(
            &mut out,
            "    ",
            "guid",
            package.source_url.as_deref().unwrap_or(""),
        );
        push_element(
            &mut out,
            "    ",
            "source",
            package.home.as_deref().unwrap_or(""),
        );
        if let Some(timestamp) = package.timestamp {
            push_element(&mut out, "    ", "pubDate", &rfc822(timestamp as i64));
        }
        out.push_str("  </item>\n");
    }

    out.push_str("</channel>\n</rss>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_rss() {
        let mut channeldata = ChannelData::default();
        channeldata.packages.insert(
            "demo".to_string(),
            ChannelDataPackage {
                version: Some("1.0".to_string()),
                summary: Some("cats & dogs".to_string()),
                timestamp: Some(1_600_000_000),
                subdirs: ["noarch".to_string()].into(),
                ..Default::default()
            },
        );
        let feed = render_rss("testchannel", &channeldata, Utc::now());
        assert!(feed.contains("<title>anaconda.org/testchannel</title>"));
        assert!(feed.contains("<title>demo 1.0 [noarch]</title>"));
        assert!(feed.contains("cats &amp; dogs"));
        assert!(feed.contains("Sun, 13 Sep 2020"));
    }

    #[test]
    fn test_recent_packages_ordered_newest_first() {
        let mut channeldata = ChannelData::default();
        for (name, timestamp) in [("old", 100u64), ("new", 300), ("mid", 200)] {
            channeldata.packages.insert(
                name.to_string(),
                ChannelDataPackage {
                    timestamp: Some(timestamp),
                    ..Default::default()
                },
            );
        }
        let names: Vec<_> = recent_packages(&channeldata)
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, ["new", "mid", "old"]);
    }
}
