//! Declarative CSS-selector schemas for scraping sites.
//!
//! A site's schema is a YAML file naming the selectors for its search-result
//! cards and its product-detail page. Selectors are validated when the file
//! loads so a typo surfaces at start-up, not on the first query.

use std::collections::BTreeMap;
use std::path::Path;

use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use url::Url;
use url::form_urlencoded;

use cartwheel_core::error::{CartwheelError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSchema {
    pub list: ListSchema,
    #[serde(default)]
    pub detail: Option<DetailSchema>,
}

/// One extracted field: a selector plus an optional attribute to read.
/// Without `attr` the element's text content is used.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSelector {
    pub selector: String,
    #[serde(default)]
    pub attr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListSchema {
    /// Selector matching one product card.
    pub item: String,
    pub name: FieldSelector,
    pub url: FieldSelector,
    pub price: FieldSelector,
    #[serde(default)]
    pub image: Option<FieldSelector>,
    #[serde(default)]
    pub brand: Option<FieldSelector>,
    #[serde(default)]
    pub rating: Option<FieldSelector>,
    #[serde(default)]
    pub original_price: Option<FieldSelector>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailSchema {
    pub name: FieldSelector,
    pub price: FieldSelector,
    #[serde(default)]
    pub original_price: Option<FieldSelector>,
    #[serde(default)]
    pub brand: Option<FieldSelector>,
    /// All matches are collected, in document order.
    #[serde(default)]
    pub images: Option<FieldSelector>,
    #[serde(default)]
    pub description: Option<FieldSelector>,
    #[serde(default)]
    pub specs: Option<SpecSelector>,
}

/// Key/value rows of a specification table.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecSelector {
    pub row: String,
    pub key: String,
    pub value: String,
}

impl SelectorSchema {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let schema: SelectorSchema = serde_yaml::from_str(raw)
            .map_err(|e| CartwheelError::Config(format!("selector schema: {e}")))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CartwheelError::Config(format!("read schema {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    fn validate(&self) -> Result<()> {
        let list = &self.list;
        let mut selectors: Vec<&str> = vec![
            &list.item,
            &list.name.selector,
            &list.url.selector,
            &list.price.selector,
        ];
        for field in [&list.image, &list.brand, &list.rating, &list.original_price] {
            if let Some(field) = field {
                selectors.push(&field.selector);
            }
        }
        if let Some(detail) = &self.detail {
            selectors.push(&detail.name.selector);
            selectors.push(&detail.price.selector);
            for field in [
                &detail.original_price,
                &detail.brand,
                &detail.images,
                &detail.description,
            ] {
                if let Some(field) = field {
                    selectors.push(&field.selector);
                }
            }
            if let Some(spec) = &detail.specs {
                selectors.extend([spec.row.as_str(), spec.key.as_str(), spec.value.as_str()]);
            }
        }
        for selector in selectors {
            compile(selector)?;
        }
        Ok(())
    }
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| CartwheelError::Validation(format!("bad selector '{selector}': {e}")))
}

#[derive(Debug, Clone)]
pub struct RawListing {
    pub name: String,
    pub url: String,
    pub price_text: String,
    pub image: Option<String>,
    pub brand: Option<String>,
    pub rating_text: Option<String>,
    pub original_price_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawDetail {
    pub name: String,
    pub price_text: String,
    pub original_price_text: Option<String>,
    pub brand: Option<String>,
    pub images: Vec<String>,
    pub description: Option<String>,
    pub specs: BTreeMap<String, String>,
}

/// Apply a list schema to a search/category page. Cards missing any of the
/// required fields (name, url, price) are skipped.
pub fn extract_list(html: &str, schema: &ListSchema, base: &Url) -> Result<Vec<RawListing>> {
    let doc = Html::parse_document(html);
    let item_sel = compile(&schema.item)?;
    let mut out = Vec::new();
    for item in doc.select(&item_sel) {
        let Some(name) = field_value(item, &schema.name) else {
            continue;
        };
        let Some(href) = field_value(item, &schema.url) else {
            continue;
        };
        let Some(price_text) = field_value(item, &schema.price) else {
            continue;
        };
        out.push(RawListing {
            name,
            url: absolutize(base, &href),
            price_text,
            image: opt_field(item, &schema.image).map(|v| absolutize(base, &v)),
            brand: opt_field(item, &schema.brand),
            rating_text: opt_field(item, &schema.rating),
            original_price_text: opt_field(item, &schema.original_price),
        });
    }
    Ok(out)
}

/// Apply a detail schema to a product page. `None` when the page does not
/// yield the required name and price (selector drift, consent wall, ...).
pub fn extract_detail(html: &str, schema: &DetailSchema, base: &Url) -> Result<Option<RawDetail>> {
    let doc = Html::parse_document(html);
    let root = doc.root_element();
    let (Some(name), Some(price_text)) = (
        field_value(root, &schema.name),
        field_value(root, &schema.price),
    ) else {
        return Ok(None);
    };

    let images = match &schema.images {
        Some(field) => {
            let sel = compile(&field.selector)?;
            root.select(&sel)
                .filter_map(|el| element_value(el, field.attr.as_deref()))
                .map(|v| absolutize(base, &v))
                .collect()
        }
        None => Vec::new(),
    };

    let mut specs = BTreeMap::new();
    if let Some(spec) = &schema.specs {
        let row_sel = compile(&spec.row)?;
        let key_sel = compile(&spec.key)?;
        let value_sel = compile(&spec.value)?;
        for row in root.select(&row_sel) {
            let key = row
                .select(&key_sel)
                .next()
                .and_then(|el| element_value(el, None));
            let value = row
                .select(&value_sel)
                .next()
                .and_then(|el| element_value(el, None));
            if let (Some(key), Some(value)) = (key, value) {
                specs.insert(key, value);
            }
        }
    }

    Ok(Some(RawDetail {
        name,
        price_text,
        original_price_text: opt_field(root, &schema.original_price),
        brand: opt_field(root, &schema.brand),
        images,
        description: opt_field(root, &schema.description),
        specs,
    }))
}

fn field_value(scope: ElementRef<'_>, field: &FieldSelector) -> Option<String> {
    let selector = Selector::parse(&field.selector).ok()?;
    let el = scope.select(&selector).next()?;
    element_value(el, field.attr.as_deref())
}

fn element_value(el: ElementRef<'_>, attr: Option<&str>) -> Option<String> {
    let raw = match attr {
        Some(attr) => el.value().attr(attr)?.to_string(),
        None => el.text().collect::<String>(),
    };
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!cleaned.is_empty()).then_some(cleaned)
}

fn opt_field(scope: ElementRef<'_>, field: &Option<FieldSelector>) -> Option<String> {
    field.as_ref().and_then(|f| field_value(scope, f))
}

pub fn absolutize(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Form-encode a template substitution value; spaces become `+`.
pub fn urlencode(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// First price-looking number in `text`, tolerant of currency symbols,
/// thousands separators (`1.299`, `1,299`, `1 299`) and both decimal
/// conventions (`49.90`, `49,90`).
pub fn parse_price(text: &str) -> Option<f64> {
    let text = text.replace('\u{a0}', " ");
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;

    let mut token = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || c == '.' || c == ',' {
            token.push(c);
            i += 1;
        } else if c == ' ' {
            // A space is only part of the number when it separates a
            // thousands group of exactly three digits.
            let group = chars[i + 1..]
                .iter()
                .take_while(|c| c.is_ascii_digit())
                .count();
            if group == 3 {
                i += 1;
            } else {
                break;
            }
        } else {
            break;
        }
    }

    let (int_raw, frac) = match token.rfind(['.', ',']) {
        None => (token.as_str(), ""),
        Some(idx) => {
            let after = &token[idx + 1..];
            if after.len() == 3 {
                // A trailing three-digit group reads as thousands.
                (token.as_str(), "")
            } else {
                (&token[..idx], after)
            }
        }
    };
    let int_digits: String = int_raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if int_digits.is_empty() {
        return None;
    }
    let joined = if frac.is_empty() {
        int_digits
    } else {
        format!("{int_digits}.{frac}")
    };
    joined.parse().ok()
}

/// Flatten a page to markdown-ish text for LLM extraction: links become
/// `[text](url)`, images `![alt](url)`, script/style subtrees are dropped,
/// and the result is capped at `max_chars`.
pub fn html_to_markdown(html: &str, base: &Url, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let scope = Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .unwrap_or_else(|| doc.root_element());

    let mut out = String::new();
    walk(scope, base, &mut out, max_chars);

    let mut cleaned = out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if cleaned.len() > max_chars {
        let mut idx = max_chars;
        while !cleaned.is_char_boundary(idx) {
            idx -= 1;
        }
        cleaned.truncate(idx);
    }
    cleaned
}

fn walk(el: ElementRef<'_>, base: &Url, out: &mut String, max_chars: usize) {
    if out.len() >= max_chars {
        return;
    }
    match el.value().name() {
        "script" | "style" | "noscript" | "svg" | "iframe" | "template" => return,
        "a" => {
            let text = el.text().collect::<String>();
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            match el.value().attr("href") {
                Some(href) => {
                    out.push_str(&format!("[{text}]({}) ", absolutize(base, href)));
                }
                None => {
                    out.push_str(&text);
                    out.push(' ');
                }
            }
            return;
        }
        "img" => {
            let alt = el.value().attr("alt").unwrap_or("");
            if let Some(src) = el.value().attr("src") {
                out.push_str(&format!("![{alt}]({}) ", absolutize(base, src)));
            }
            return;
        }
        _ => {}
    }

    for child in el.children() {
        if out.len() >= max_chars {
            break;
        }
        if let Some(child_el) = ElementRef::wrap(child) {
            walk(child_el, base, out, max_chars);
            if is_block(child_el.value().name()) {
                out.push('\n');
            }
        } else if let Some(text) = child.value().as_text() {
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                out.push_str(&text);
                out.push(' ');
            }
        }
    }
}

fn is_block(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div"
            | "section"
            | "article"
            | "li"
            | "ul"
            | "ol"
            | "tr"
            | "table"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "br"
            | "header"
            | "footer"
            | "main"
    )
}
