//! Embedded images in article bodies.
use std::collections::{HashMap, HashSet};

use regex::{Captures, Regex};

use crate::error::ContentError;
use crate::migrate::reconcile::slugify;
use crate::model::Picture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub src: String,
    pub alt: String,
}

impl ImageRef {
    /// Whether the source can become a stored picture at all.
    pub fn is_resolvable(&self) -> bool {
        let src = self.src.trim();
        let lower = src.to_ascii_lowercase();
        !(src.is_empty() || lower.starts_with("data:") || lower.starts_with("javascript:"))
    }
}

/// Image extraction and reference rewriting over rich text.
pub trait ContentExtractor: Send + Sync {
    /// `(src, alt)` of every `<img>` in `html`. Malformed markup is reported, not
    /// skipped, so the caller can count it.
    fn extract_images(&self, html: &str) -> Result<Vec<ImageRef>, ContentError>;

    /// Replaces image sources found in `sources`; returns the new text and the
    /// number of replaced references.
    fn rewrite_image_sources(&self, html: &str, sources: &HashMap<String, String>) -> (String, usize);
}

pub struct ImgTagScanner {
    attr: Regex,
    src: Regex,
}

impl ImgTagScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            attr: Regex::new(
                r#"(?i)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#,
            )?,
            // Quoted values before `src` are skipped whole, so a `>` inside
            // them does not end the tag.
            src: Regex::new(
                r#"(?i)(<img\b(?:[^>"']|"[^"]*"|'[^']*')*?\ssrc\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#,
            )?,
        })
    }
}

impl ContentExtractor for ImgTagScanner {
    fn extract_images(&self, html: &str) -> Result<Vec<ImageRef>, ContentError> {
        let lower = html.to_ascii_lowercase();
        let bytes = lower.as_bytes();
        let mut images = Vec::new();
        let mut pos = 0;
        while let Some(rel) = lower[pos..].find("<img") {
            let start = pos + rel;
            let after = start + 4;
            if !matches!(bytes.get(after), Some(b' ' | b'\t' | b'\n' | b'\r' | b'/' | b'>')) {
                pos = after;
                continue;
            }
            let end = after + tag_end(&bytes[after..], start)?;
            let mut src = None;
            let mut alt = String::new();
            for cap in self.attr.captures_iter(&html[after..end]) {
                let value = cap
                    .get(2)
                    .or_else(|| cap.get(3))
                    .or_else(|| cap.get(4))
                    .map(|m| decode_entities(m.as_str()))
                    .unwrap_or_default();
                match cap[1].to_ascii_lowercase().as_str() {
                    "src" => src = Some(value),
                    "alt" => alt = value,
                    _ => {}
                }
            }
            if let Some(src) = src {
                images.push(ImageRef {
                    src: src.trim().to_string(),
                    alt: alt.trim().to_string(),
                });
            }
            pos = end + 1;
        }
        Ok(images)
    }

    fn rewrite_image_sources(&self, html: &str, sources: &HashMap<String, String>) -> (String, usize) {
        let mut replaced = 0;
        let text = self.src.replace_all(html, |caps: &Captures<'_>| {
            let raw = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or("");
            match sources.get(decode_entities(raw).trim()) {
                Some(new_src) => {
                    replaced += 1;
                    format!("{}\"{}\"", &caps[1], new_src)
                }
                None => caps[0].to_string(),
            }
        });
        (text.into_owned(), replaced)
    }
}

/// Offset of the `>` closing a tag whose attributes start at `bytes[0]`.
fn tag_end(bytes: &[u8], tag_start: usize) -> Result<usize, ContentError> {
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match (quote, b) {
            (None, b'"' | b'\'') => quote = Some(b),
            (Some(q), _) if b == q => quote = None,
            (None, b'>') => return Ok(i),
            _ => {}
        }
    }
    match quote {
        Some(_) => Err(ContentError::UnbalancedQuotes { offset: tag_start }),
        None => Err(ContentError::UnterminatedTag { offset: tag_start }),
    }
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// Pictures discovered while reading articles. Ids are handed out in order of
/// first appearance, so a re-run over the same source yields the same ids.
#[derive(Debug, Clone)]
pub struct PictureRegistry {
    next_id: i64,
    by_src: HashMap<String, i64>,
    pictures: Vec<Picture>,
    paths: HashSet<String>,
}

impl PictureRegistry {
    pub fn starting_at(first_id: i64) -> Self {
        Self {
            next_id: first_id.max(1),
            by_src: HashMap::new(),
            pictures: Vec::new(),
            paths: HashSet::new(),
        }
    }

    /// Picture id for `image`, registering it on first sight.
    pub fn register(&mut self, image: &ImageRef) -> i64 {
        if let Some(&id) = self.by_src.get(&image.src) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;

        let file = file_name(&image.src);
        let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
        let name = if image.alt.is_empty() {
            stem.replace(['_', '-'], " ")
        } else {
            image.alt.clone()
        };
        let base = slugify(&name);
        let slug = if base.is_empty() {
            format!("picture-{id}")
        } else {
            format!("{base}-{id}")
        };
        let mut image_path = format!("pictures/{file}");
        if file.is_empty() || !self.paths.insert(image_path.clone()) {
            image_path = format!("pictures/{id}-{file}");
            self.paths.insert(image_path.clone());
        }

        self.by_src.insert(image.src.clone(), id);
        self.pictures.push(Picture {
            id,
            name: if name.trim().is_empty() { format!("Picture {id}") } else { name },
            slug,
            image: image_path,
            description: image.alt.clone(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.pictures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }

    pub fn pictures(&self) -> &[Picture] {
        &self.pictures
    }

    /// Original source → public URL of the stored picture.
    pub fn url_map(&self, media_url: &str) -> HashMap<String, String> {
        let by_id: HashMap<i64, &Picture> = self.pictures.iter().map(|p| (p.id, p)).collect();
        self.by_src
            .iter()
            .filter_map(|(src, id)| {
                by_id
                    .get(id)
                    .map(|p| (src.clone(), format!("{media_url}{}", p.image)))
            })
            .collect()
    }
}

fn file_name(src: &str) -> &str {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    path.rsplit('/').next().unwrap_or(path).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> ImgTagScanner {
        ImgTagScanner::new().unwrap()
    }

    #[test]
    fn extracts_src_and_alt_in_any_quoting() {
        let html = r#"<p>Intro <IMG SRC="images/a.jpg" ALT="First"> and
            <img alt='Second' src='images/b.png' /> plus <img src=images/c.gif></p>"#;
        let images = scanner().extract_images(html).unwrap();
        assert_eq!(
            images,
            vec![
                ImageRef { src: "images/a.jpg".into(), alt: "First".into() },
                ImageRef { src: "images/b.png".into(), alt: "Second".into() },
                ImageRef { src: "images/c.gif".into(), alt: String::new() },
            ]
        );
    }

    #[test]
    fn ignores_lookalike_tags_and_imgs_without_src() {
        let html = r#"<imgur>x</imgur><img alt="no source"><img src="a&amp;b.jpg" title="x > y">"#;
        let images = scanner().extract_images(html).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].src, "a&b.jpg");
    }

    #[test]
    fn reports_malformed_markup() {
        assert_eq!(
            scanner().extract_images("text <img src=\"a.jpg\""),
            Err(ContentError::UnterminatedTag { offset: 5 })
        );
        assert_eq!(
            scanner().extract_images("<img src=\"a.jpg>"),
            Err(ContentError::UnbalancedQuotes { offset: 0 })
        );
    }

    #[test]
    fn unresolvable_sources() {
        let img = |src: &str| ImageRef { src: src.into(), alt: String::new() };
        assert!(img("images/x.jpg").is_resolvable());
        assert!(!img("  ").is_resolvable());
        assert!(!img("data:image/png;base64,AAAA").is_resolvable());
    }

    #[test]
    fn registry_dedupes_and_numbers_deterministically() {
        let mut reg = PictureRegistry::starting_at(1);
        let a = ImageRef { src: "images/stories/logo.png".into(), alt: String::new() };
        let b = ImageRef { src: "http://example.org/other/logo.png?v=2".into(), alt: "Site logo".into() };
        assert_eq!(reg.register(&a), 1);
        assert_eq!(reg.register(&b), 2);
        assert_eq!(reg.register(&a), 1);
        assert_eq!(reg.len(), 2);

        let pics = reg.pictures();
        assert_eq!(pics[0].name, "logo");
        assert_eq!(pics[0].slug, "logo-1");
        assert_eq!(pics[0].image, "pictures/logo.png");
        assert_eq!(pics[1].name, "Site logo");
        assert_eq!(pics[1].image, "pictures/2-logo.png");

        let urls = reg.url_map("/media/");
        assert_eq!(urls["images/stories/logo.png"], "/media/pictures/logo.png");
    }

    #[test]
    fn rewrites_only_known_sources() {
        let mut map = HashMap::new();
        map.insert("images/a.jpg".to_string(), "/media/pictures/a.jpg".to_string());
        let html = r#"<img src="images/a.jpg" alt="A"><img src='images/z.jpg'><IMG class="x" SRC='images/a.jpg'>"#;
        let (out, n) = scanner().rewrite_image_sources(html, &map);
        assert_eq!(n, 2);
        assert_eq!(
            out,
            r#"<img src="/media/pictures/a.jpg" alt="A"><img src='images/z.jpg'><IMG class="x" SRC="/media/pictures/a.jpg">"#
        );
    }

    #[test]
    fn rewrites_every_source_it_extracts() {
        let s = scanner();
        let html = r#"<p><img src=images/c.gif></p><img title="a>b" src="images/d.png"><img data-src="images/c.gif" src='images/z.jpg'>"#;
        let extracted: Vec<String> = s.extract_images(html).unwrap().into_iter().map(|i| i.src).collect();
        assert_eq!(extracted, vec!["images/c.gif", "images/d.png", "images/z.jpg"]);

        let mut map = HashMap::new();
        map.insert("images/c.gif".to_string(), "/media/pictures/c.gif".to_string());
        map.insert("images/d.png".to_string(), "/media/pictures/d.png".to_string());
        let (out, n) = s.rewrite_image_sources(html, &map);
        assert_eq!(n, 2);
        assert_eq!(
            out,
            r#"<p><img src="/media/pictures/c.gif"></p><img title="a>b" src="/media/pictures/d.png"><img data-src="images/c.gif" src='images/z.jpg'>"#
        );
    }
}
