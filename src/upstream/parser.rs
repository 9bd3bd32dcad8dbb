use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::debug;

use super::{DraftListing, ListingDetail, ScrapedPage};
use crate::entities::DealType;

/// Minimum cells a result row needs: location, item, quantity, price, shop.
const MIN_COLUMNS: usize = 5;

/// Why a single row was skipped. Never fatal for the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseSkip {
    TooFewColumns(usize),
    HeaderRow,
    MissingName,
}

struct Selectors {
    total: Selector,
    table: Selector,
    row: Selector,
    cell: Selector,
    img: Selector,
    link: Selector,
    th: Selector,
    li: Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: OnceLock<Selectors> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        let parse = |s: &str| Selector::parse(s).expect("Invalid selector defined in code");
        Selectors {
            total: parse("#searchResult strong"),
            table: parse("table.listTypeOfDefault.dealList"),
            row: parse("tr"),
            cell: parse("td"),
            img: parse("img"),
            link: parse("a"),
            th: parse("th"),
            li: parse("li"),
        }
    })
}

fn click_handler() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"CallItemDealView\s*\(([^)]*)\)").expect("Invalid regex pattern defined in code")
    })
}

fn line_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("Invalid regex pattern defined in code"))
}

/// Parses one upstream result page. Malformed rows are skipped and counted.
#[must_use]
pub fn parse_page(html: &str, page: u32, origin: &str) -> ScrapedPage {
    let doc = Html::parse_document(html);
    let sel = selectors();

    let reported_total = doc
        .select(&sel.total)
        .next()
        .and_then(|el| digits(&text_of(el)).parse::<i64>().ok());

    let Some(table) = doc.select(&sel.table).next() else {
        return ScrapedPage {
            page,
            total: reported_total.unwrap_or(0),
            ..ScrapedPage::default()
        };
    };

    let mut listings = Vec::new();
    let mut skipped_rows = 0;

    // first row is the column header
    for row in table.select(&sel.row).skip(1) {
        match parse_row(row, origin) {
            Ok(listing) => listings.push(listing),
            Err(skip) => {
                debug!(page, ?skip, "skipped upstream row");
                skipped_rows += 1;
            }
        }
    }

    let total = match reported_total {
        Some(total) if total > 0 => total,
        _ => i64::try_from(listings.len()).unwrap_or(i64::MAX),
    };

    ScrapedPage {
        page,
        listings,
        total,
        skipped_rows,
        table_found: true,
    }
}

/// Turns one `<tr>` into a draft listing.
pub fn parse_row(row: ElementRef<'_>, origin: &str) -> Result<DraftListing, ParseSkip> {
    let sel = selectors();
    let cells: Vec<ElementRef<'_>> = row.select(&sel.cell).collect();
    if cells.len() < MIN_COLUMNS {
        return Err(ParseSkip::TooFewColumns(cells.len()));
    }

    let location = text_of(cells[0]);
    let item_cell = cells[1];
    let img = item_cell.select(&sel.img).next();

    // the visible text is truncated, the alt attribute is not
    let item_name = img
        .and_then(|img| img.value().attr("alt"))
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .map_or_else(|| text_of(item_cell), str::to_string);

    if location.contains("상인명") || item_name.contains("아이템명") {
        return Err(ParseSkip::HeaderRow);
    }
    if item_name.is_empty() {
        return Err(ParseSkip::MissingName);
    }

    let quantity = digits(&text_of(cells[2])).parse::<i32>().unwrap_or(1);
    let price = digits(&text_of(cells[3])).parse::<i64>().unwrap_or(0);
    let shop_name = text_of(cells[4]);

    let deal_type = cells
        .get(5)
        .map_or(DealType::Sell, |cell| DealType::from_label(&text_of(*cell)));

    let src = img.and_then(|img| img.value().attr("src"));
    let image_url = src.and_then(|src| absolute_url(src, origin));
    let image_item_id = src.and_then(image_stem_id);

    let (map_id, transaction_id) = item_cell
        .select(&sel.link)
        .find_map(|a| {
            a.value()
                .attr("onclick")
                .or_else(|| a.value().attr("href"))
                .and_then(deal_view_ids)
        })
        .map_or((None, None), |(map_id, ssi)| (Some(map_id), Some(ssi)));

    Ok(DraftListing {
        item_name,
        image_url,
        image_item_id,
        price,
        quantity,
        shop_name,
        seller_name: None,
        location: Some(location).filter(|l| !l.is_empty()),
        deal_type,
        map_id,
        transaction_id,
    })
}

/// Pulls `(mapID, ssi)` out of `CallItemDealView(svrID, mapID, ssi, curpage)`.
#[must_use]
pub fn deal_view_ids(handler: &str) -> Option<(String, String)> {
    let args = click_handler().captures(handler)?.get(1)?.as_str();
    let args: Vec<String> = args
        .split(',')
        .map(|arg| arg.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .collect();

    match (args.get(1), args.get(2)) {
        (Some(map_id), Some(ssi)) if !map_id.is_empty() && !ssi.is_empty() => {
            Some((map_id.clone(), ssi.clone()))
        }
        _ => None,
    }
}

/// Parses an upstream listing detail page.
#[must_use]
pub fn parse_detail(html: &str, map_id: &str, transaction_id: &str) -> ListingDetail {
    let doc = Html::parse_document(html);

    let mut detail = ListingDetail {
        map_id: map_id.to_string(),
        transaction_id: transaction_id.to_string(),
        ..ListingDetail::default()
    };

    // "Shop title (Character name)"
    if let Some(shop) = cell_after_header(&doc, "노점 이름") {
        let full = text_of(shop);
        match (full.find('('), full.rfind(')')) {
            (Some(open), Some(close)) if open < close => {
                detail.shop_title = Some(full[..open].trim().to_string());
                detail.seller_name = Some(full[open + 1..close].trim().to_string());
            }
            _ => {
                detail.shop_title = Some(full.clone());
                detail.seller_name = Some(full);
            }
        }
    }

    if let Some(slots) = cell_after_header(&doc, "슬롯정보") {
        detail.slots.extend(cell_entries(slots));
    }
    if let Some(options) = cell_after_header(&doc, "랜덤옵션") {
        detail
            .slots
            .extend(cell_entries(options).into_iter().map(|o| format!("[옵션] {o}")));
    }

    detail
}

fn cell_after_header<'a>(doc: &'a Html, label: &str) -> Option<ElementRef<'a>> {
    doc.select(&selectors().th)
        .find(|th| text_of(*th).contains(label))?
        .next_siblings()
        .find_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
}

/// List items of a detail cell, or its `<br>`-separated lines.
fn cell_entries(cell: ElementRef<'_>) -> Vec<String> {
    let items: Vec<String> = cell.select(&selectors().li).map(text_of).collect();
    let entries = if items.is_empty() {
        line_break()
            .split(&cell.inner_html())
            .map(|part| {
                let fragment = Html::parse_fragment(part);
                collapse_whitespace(&fragment.root_element().text().collect::<String>())
            })
            .collect()
    } else {
        items
    };

    entries
        .into_iter()
        .filter(|entry| !entry.is_empty() && entry != "-")
        .collect()
}

fn text_of(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digits(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

pub fn absolute_url(src: &str, origin: &str) -> Option<String> {
    if src.starts_with("//") {
        Some(format!("https:{src}"))
    } else if src.starts_with("http") {
        Some(src.to_string())
    } else if src.starts_with('/') {
        Some(format!("{}{src}", origin.trim_end_matches('/')))
    } else {
        None
    }
}

/// Numeric file stem of an image path, e.g. `.../501.png` gives 501.
pub fn image_stem_id(src: &str) -> Option<i32> {
    let file = src.rsplit('/').next()?;
    let stem = file.split('.').next()?;
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
