//! Directory entries and the rendered listing document.

use std::time::SystemTime;

use html_escape::{encode_double_quoted_attribute, encode_text};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// One child of a listed directory.
///
/// Read fresh from the filesystem for every request and dropped when the
/// response is written; nothing here is cached.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Bytes that cannot appear raw in a path segment of an href.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'%')
    .add(b'&')
    .add(b'+');

/// Width of the name column, parent-link row included.
const NAME_COL: usize = 50;

/// Renders the listing for `path` as an HTML document.
///
/// `path` is the request path as received (still percent-encoded); it seeds
/// both the title and the href base. Hrefs are absolute so the links work
/// whether or not the client requested the directory with a trailing slash.
/// Entries are emitted in the order given; ordering policy belongs to
/// [`SortPolicy`](crate::SortPolicy), not here.
pub fn render(path: &str, entries: &[DirEntry]) -> String {
    let title = encode_text(path);
    let mut html = format!(
        "<html><head><title>Index of {title}</title></head><body><h1>Index of {title}</h1><hr><pre>\n"
    );

    if !path.trim_end_matches('/').is_empty() {
        html.push_str("<a href=\"..\">../</a>\n");
    }

    let base = path.trim_end_matches('/');
    for entry in entries {
        let slash = if entry.is_dir { "/" } else { "" };
        let display = format!("{}{slash}", entry.name);
        let href = format!("{base}/{}{slash}", utf8_percent_encode(&entry.name, SEGMENT));

        let pad = " ".repeat(NAME_COL.saturating_sub(display.chars().count()));
        let modified = entry
            .modified
            .map(httpdate::fmt_http_date)
            .unwrap_or_else(|| "-".to_string());
        let size = if entry.is_dir { "-".to_string() } else { entry.size.to_string() };

        html.push_str(&format!(
            "<a href=\"{}\">{}</a>{pad} {modified} {size:>12}\n",
            encode_double_quoted_attribute(&href),
            encode_text(&display),
        ));
    }

    html.push_str("</pre><hr></body></html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_dir: bool) -> DirEntry {
        DirEntry { name: name.to_string(), is_dir, size: 7, modified: None }
    }

    #[test]
    fn links_are_absolute_and_distinguish_directories() {
        let html = render("/pub", &[entry("sub", true), entry("a.txt", false)]);
        assert!(html.contains("<a href=\"/pub/sub/\">sub/</a>"));
        assert!(html.contains("<a href=\"/pub/a.txt\">a.txt</a>"));
    }

    #[test]
    fn trailing_slash_requests_produce_the_same_links() {
        let html = render("/pub/", &[entry("a.txt", false)]);
        assert!(html.contains("<a href=\"/pub/a.txt\">a.txt</a>"));
    }

    #[test]
    fn root_listing_has_no_parent_link() {
        let root = render("/", &[entry("a.txt", false)]);
        assert!(!root.contains("href=\"..\""));

        let nested = render("/pub", &[entry("a.txt", false)]);
        assert!(nested.contains("<a href=\"..\">../</a>"));
    }

    #[test]
    fn names_are_escaped_for_html() {
        let html = render("/", &[entry("<script>.txt", false)]);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;.txt"));
    }

    #[test]
    fn names_are_percent_encoded_in_hrefs() {
        let html = render("/", &[entry("a b.txt", false)]);
        assert!(html.contains("href=\"/a%20b.txt\""));
        assert!(html.contains(">a b.txt</a>"));
    }
}
