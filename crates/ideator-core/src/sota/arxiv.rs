use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::NaiveDate;

use super::{ArxivPaper, PaperSearch, SotaError};

pub const ARXIV_API: &str = "http://export.arxiv.org/api/query";

pub struct Arxiv {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Arxiv {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            base_url: ARXIV_API.to_string(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl PaperSearch for Arxiv {
    fn name(&self) -> &str {
        "arXiv"
    }

    fn search<'a>(
        &'a self,
        topic: &'a str,
        max_results: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ArxivPaper>, SotaError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}?search_query={}&start=0&max_results={}&sortBy=relevance&sortOrder=descending",
                self.base_url,
                urlencoding::encode(&build_query(topic)),
                max_results
            );

            let resp = self
                .client
                .get(&url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| SotaError::Search(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(SotaError::Http {
                    service: "arXiv",
                    status: resp.status().as_u16(),
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|e| SotaError::Search(e.to_string()))?;

            let papers = parse_feed(&body)?;
            tracing::debug!(count = papers.len(), "arXiv entries parsed");
            Ok(papers)
        })
    }
}

/// Search title, abstract and all fields for the quoted topic.
pub fn build_query(topic: &str) -> String {
    let clean = topic.replace('"', "");
    let clean = clean.trim();
    format!(r#"all:"{0}" OR ti:"{0}" OR abs:"{0}""#, clean)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Id,
    Title,
    Summary,
    Published,
    Updated,
    AuthorName,
}

#[derive(Default)]
struct EntryBuilder {
    id: String,
    title: String,
    summary: String,
    published: String,
    updated: String,
    authors: Vec<String>,
    author_name: String,
    categories: Vec<String>,
    pdf_url: Option<String>,
}

impl EntryBuilder {
    fn text_mut(&mut self, field: Field) -> Option<&mut String> {
        match field {
            Field::Id => Some(&mut self.id),
            Field::Title => Some(&mut self.title),
            Field::Summary => Some(&mut self.summary),
            Field::Published => Some(&mut self.published),
            Field::Updated => Some(&mut self.updated),
            Field::AuthorName => Some(&mut self.author_name),
            Field::None => None,
        }
    }

    fn attributes(&mut self, e: &quick_xml::events::BytesStart<'_>) {
        let mut href = None;
        let mut is_pdf = false;
        for attr in e.attributes().flatten() {
            let value = String::from_utf8_lossy(&attr.value).to_string();
            match (e.local_name().as_ref(), attr.key.as_ref()) {
                (b"category", b"term") => self.categories.push(value),
                (b"link", b"href") => href = Some(value),
                (b"link", b"title") => is_pdf = value == "pdf",
                _ => {}
            }
        }
        if is_pdf && self.pdf_url.is_none() {
            self.pdf_url = href;
        }
    }

    /// `None` for arXiv's error entries and entries without an id.
    fn build(self) -> Option<ArxivPaper> {
        let url = self.id.trim().to_string();
        if url.is_empty() || url.contains("/api/errors") {
            return None;
        }
        // Old-style ids keep their archive prefix (`cs/9901001v1`).
        let arxiv_id = match url.split_once("/abs/") {
            Some((_, id)) => id.trim_matches('/').to_string(),
            None => url.rsplit('/').next().unwrap_or(&url).to_string(),
        };
        let title = collapse(&self.title);
        Some(ArxivPaper {
            arxiv_id,
            title: if title.is_empty() {
                "Unknown".into()
            } else {
                title
            },
            abstract_text: collapse(&self.summary),
            authors: self.authors,
            published: parse_date(&self.published),
            updated: parse_date(&self.updated),
            categories: self.categories,
            url,
            pdf_url: self.pdf_url,
        })
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let day = s.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Parse an arXiv Atom feed into papers, in feed order.
pub fn parse_feed(xml: &str) -> Result<Vec<ArxivPaper>, SotaError> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut papers = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut field = Field::None;
    let mut in_author = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                if local.as_ref() == b"entry" {
                    entry = Some(EntryBuilder::default());
                } else if let Some(b) = entry.as_mut() {
                    match local.as_ref() {
                        b"author" => in_author = true,
                        b"name" if in_author => {
                            b.author_name.clear();
                            field = Field::AuthorName;
                        }
                        b"id" if !in_author => field = Field::Id,
                        b"title" => field = Field::Title,
                        b"summary" => field = Field::Summary,
                        b"published" => field = Field::Published,
                        b"updated" => field = Field::Updated,
                        b"link" | b"category" => b.attributes(e),
                        _ => {}
                    }
                }
            }
            Ok(Event::Empty(ref e)) => {
                if let Some(b) = entry.as_mut() {
                    b.attributes(e);
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Some(slot) = entry.as_mut().and_then(|b| b.text_mut(field)) {
                    let text = e.unescape().unwrap_or_default();
                    slot.push_str(&text);
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"entry" => {
                    if let Some(paper) = entry.take().and_then(EntryBuilder::build) {
                        papers.push(paper);
                    }
                    field = Field::None;
                    in_author = false;
                }
                b"author" => {
                    if let Some(b) = entry.as_mut() {
                        let name = collapse(&b.author_name);
                        if !name.is_empty() {
                            b.authors.push(name);
                        }
                        b.author_name.clear();
                    }
                    in_author = false;
                }
                _ => field = Field::None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(SotaError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}

/// Keep papers published inside the window. Undated papers are dropped when
/// either bound is set.
pub fn filter_by_date(
    papers: Vec<ArxivPaper>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<ArxivPaper> {
    if start.is_none() && end.is_none() {
        return papers;
    }
    papers
        .into_iter()
        .filter(|p| match p.published {
            Some(d) => start.is_none_or(|s| d >= s) && end.is_none_or(|e| d <= e),
            None => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="html">ArXiv Query: search_query=all:moe</title>
  <id>http://arxiv.org/api/abc</id>
  <entry>
    <id>http://arxiv.org/abs/2401.01234v2</id>
    <updated>2024-02-01T00:00:00Z</updated>
    <published>2024-01-15T18:00:00Z</published>
    <title>Sparse Mixtures
      of Experts &amp; Routing</title>
    <summary>  We route tokens
      to experts.  </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2401.01234v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2401.01234v2" rel="related" type="application/pdf"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/cs/9901001v1</id>
    <title>Old Paper</title>
    <summary>Old.</summary>
  </entry>
</feed>"#;

    #[test]
    fn parses_entries() {
        let papers = parse_feed(FEED).unwrap();
        assert_eq!(papers.len(), 2);

        let p = &papers[0];
        assert_eq!(p.arxiv_id, "2401.01234v2");
        assert_eq!(p.title, "Sparse Mixtures of Experts & Routing");
        assert_eq!(p.abstract_text, "We route tokens to experts.");
        assert_eq!(p.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(p.published, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(p.updated, NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(p.categories, vec!["cs.LG", "cs.CL"]);
        assert_eq!(p.pdf_url.as_deref(), Some("http://arxiv.org/pdf/2401.01234v2"));
        assert_eq!(p.url, "http://arxiv.org/abs/2401.01234v2");

        assert_eq!(papers[1].arxiv_id, "cs/9901001v1");
        assert_eq!(
            crate::sota::semantic_scholar::strip_version(&papers[1].arxiv_id),
            "cs/9901001"
        );
        assert!(papers[1].published.is_none());
    }

    #[test]
    fn error_entry_skipped() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry><id>http://arxiv.org/api/errors#incorrect_id</id><title>Error</title></entry></feed>"#;
        assert!(parse_feed(xml).unwrap().is_empty());
    }

    #[test]
    fn query_strips_quotes() {
        assert_eq!(
            build_query(r#" "sparse" experts "#),
            r#"all:"sparse experts" OR ti:"sparse experts" OR abs:"sparse experts""#
        );
    }

    #[test]
    fn date_window() {
        let papers = parse_feed(FEED).unwrap();
        let jan = NaiveDate::from_ymd_opt(2024, 1, 1);
        let feb = NaiveDate::from_ymd_opt(2024, 2, 1);

        assert_eq!(filter_by_date(papers.clone(), None, None).len(), 2);
        let kept = filter_by_date(papers.clone(), jan, feb);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].arxiv_id, "2401.01234v2");
        assert!(filter_by_date(papers, feb, None).is_empty());
    }
}
