//! Pure HTML → product extraction. No I/O lives here; the heuristics are
//! coupled to the monitored storefront's markup, so they sit behind the
//! `PageParser` seam and can be swapped without touching the pipeline.

use crate::model::NewProduct;
use scraper::{ElementRef, Html, Selector};
use url::Url;

const MAX_NAME_LEN: usize = 255;

/// Turns fetched markup into an ordered product list. Implementations must be
/// pure and must not fail: malformed markup yields an empty list.
pub trait PageParser: Send + Sync {
    fn parse(&self, html: &str) -> Vec<NewProduct>;
}

/// Parser for storefront listing pages that render product cards as anchors
/// wrapping an image, with single-segment slug URLs like `/heart-dragon/`.
#[derive(Debug, Clone)]
pub struct CardGridParser {
    base_url: Url,
}

impl CardGridParser {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }
}

impl PageParser for CardGridParser {
    fn parse(&self, html: &str) -> Vec<NewProduct> {
        let document = Html::parse_document(html);
        let anchor_sel = Selector::parse("a[href]").expect("valid selector");
        let img_sel = Selector::parse("img").expect("valid selector");

        let mut products: Vec<NewProduct> = Vec::new();

        for anchor in document.select(&anchor_sel) {
            let Some(img) = anchor.select(&img_sel).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Ok(resolved) = self.base_url.join(href) else {
                continue;
            };
            if !is_product_path(resolved.path()) {
                continue;
            }

            let Some(name) = product_name(&anchor, &img) else {
                continue;
            };

            let image_url = img
                .value()
                .attr("src")
                .or_else(|| img.value().attr("data-src"))
                .map(str::to_string);

            let external_id = external_id_from_url(&resolved);
            if products.iter().any(|p| p.external_id == external_id) {
                continue;
            }

            let position = products.len();
            products.push(NewProduct {
                external_id,
                name,
                url: resolved.to_string(),
                image_url,
                position,
            });
        }

        products
    }
}

/// Product URLs on the monitored site are a single path segment. Everything
/// else (home, listings, account pages) is skipped.
fn is_product_path(path: &str) -> bool {
    let non_product = path == "/"
        || path == "/new"
        || path == "/shop-all"
        || path == "/login.php"
        || path.starts_with("/collections/")
        || path.starts_with("/category/")
        || path.starts_with("/about")
        || path.starts_with("/help");
    if non_product {
        return false;
    }

    path.split('/').filter(|s| !s.is_empty()).count() == 1
}

/// Stable external id derived from the URL slug.
///
/// If the slug's final hyphen-delimited token contains a digit it is treated
/// as a SKU and used on its own; this distinguishes catalog variants sharing
/// a base name. Examples:
/// - `https://jellycat.com/heart-dragon/` -> `heart-dragon`
/// - `https://jellycat.com/eu/amuseable-croissant-a2croi/` -> `a2croi`
pub fn external_id_from_url(url: &Url) -> String {
    let path = url.path().trim_end_matches('/');
    let last_segment = path.rsplit('/').next().unwrap_or(path);

    let last_token = last_segment.rsplit('-').next().unwrap_or(last_segment);
    if last_token.chars().any(|c| c.is_ascii_digit()) {
        last_token.to_string()
    } else {
        last_segment.to_string()
    }
}

/// Display name for a card: image alt, then anchor title, then any nested
/// element with a name/title-ish class, then the anchor's visible text.
fn product_name(anchor: &ElementRef, img: &ElementRef) -> Option<String> {
    let from_attr = |v: Option<&str>| {
        v.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let name = from_attr(img.value().attr("alt"))
        .or_else(|| from_attr(anchor.value().attr("title")))
        .or_else(|| nested_name_text(anchor))
        .or_else(|| {
            let text = anchor.text().collect::<String>();
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        })?;

    if name.chars().count() < 2 {
        return None;
    }
    Some(name.chars().take(MAX_NAME_LEN).collect())
}

fn nested_name_text(anchor: &ElementRef) -> Option<String> {
    let sel = Selector::parse("[class*=\"name\"], [class*=\"title\"]").expect("valid selector");
    let text = anchor
        .select(&sel)
        .flat_map(|el| el.text())
        .collect::<String>();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
