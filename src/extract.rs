use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::error::{Error, Result};

/// One practitioner block from the search results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub name: String,
    pub url: String,
    /// Whole card text, whitespace collapsed.
    pub text: String,
}

/// Extract practitioner cards from a rendered search page.
///
/// Every anchor whose href contains `link_fragment` is a candidate; its card
/// is the nearest `<article>` or `<div class="…card…">` around it. Anchors
/// without text, href or enclosing card are skipped.
pub fn cards(html: &str, base: &Url, link_fragment: &str) -> Result<Vec<Card>> {
    let selector = Selector::parse(&format!("a[href*='{}']", link_fragment))
        .map_err(|e| Error::config(format!("invalid link selector for '{}': {}", link_fragment, e)))?;

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    let mut anchors = 0usize;

    for link in document.select(&selector) {
        anchors += 1;

        let name = collapse(link.text());
        let href = link.value().attr("href").unwrap_or("").trim();
        if name.is_empty() || href.is_empty() {
            continue;
        }

        let Ok(url) = base.join(href) else {
            debug!(href, "skipping unresolvable link");
            continue;
        };

        let Some(card) = enclosing_card(link) else {
            continue;
        };

        out.push(Card {
            name,
            url: url.to_string(),
            text: collapse(card.text()),
        });
    }

    debug!(anchors, cards = out.len(), "extracted cards");
    Ok(out)
}

fn enclosing_card(link: ElementRef<'_>) -> Option<ElementRef<'_>> {
    link.ancestors().filter_map(ElementRef::wrap).find(|el| {
        let node = el.value();
        match node.name() {
            "article" => true,
            "div" => node.attr("class").is_some_and(|c| c.contains("card")),
            _ => false,
        }
    })
}

fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let joined = parts.collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}
