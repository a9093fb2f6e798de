use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use crate::dates::{Availability, DateParser};
use crate::extract::Card;

/// A practitioner whose next availability falls inside the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub name: String,
    pub url: String,
    pub availability: Availability,
}

impl Listing {
    /// `YYYY-MM-DD[ HH:MM]  name  url`
    pub fn console_line(&self) -> String {
        format!("{}  {}  {}", self.availability, self.name, self.url)
    }
}

/// Calendar day of `now` in the search's time zone.
pub fn local_today(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Keep cards whose stated date is within `[today, today + window_days]`,
/// dropping repeated `(name, url)` pairs and sorting by date. Ties keep page order.
pub fn select(cards: &[Card], parser: &DateParser, today: NaiveDate, window_days: u32) -> Vec<Listing> {
    let last_day = today + Duration::days(i64::from(window_days));
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut out = Vec::new();

    for card in cards {
        let Some(availability) = parser.parse(&card.text, today) else {
            debug!(name = %card.name, "no availability phrase on card");
            continue;
        };

        if availability.date < today || availability.date > last_day {
            debug!(name = %card.name, date = %availability.date, "outside window");
            continue;
        }

        if !seen.insert((card.name.as_str(), card.url.as_str())) {
            continue;
        }

        out.push(Listing {
            name: card.name.clone(),
            url: card.url.clone(),
            availability,
        });
    }

    out.sort_by_key(|l| l.availability);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn card(name: &str, url: &str, text: &str) -> Card {
        Card {
            name: name.to_string(),
            url: url.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn keeps_window_sorts_and_dedupes() {
        let cards = vec![
            card("Dr C", "https://x/c", "Prochain RDV le 20 mars 2025"),
            card("Dr A", "https://x/a", "Prochain RDV le 12 mars 2025"),
            card("Dr Late", "https://x/late", "Prochain RDV le 30 avril 2025"),
            card("Dr None", "https://x/none", "Aucune disponibilité en ligne"),
            card("Dr A", "https://x/a", "Prochain RDV le 12 mars 2025"),
            card("Dr B", "https://x/b", "Disponible demain"),
        ];

        let got = select(&cards, &DateParser::new(), d(2025, 3, 10), 14);
        let names: Vec<&str> = got.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Dr B", "Dr A", "Dr C"]);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let cards = vec![
            card("Today", "https://x/1", "Prochain RDV le 10 mars 2025"),
            card("Last", "https://x/2", "Prochain RDV le 24 mars 2025"),
            card("Over", "https://x/3", "Prochain RDV le 25 mars 2025"),
            card("Past", "https://x/4", "Prochain RDV le 9 mars 2025"),
        ];
        let got = select(&cards, &DateParser::new(), d(2025, 3, 10), 14);
        let names: Vec<&str> = got.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Today", "Last"]);
    }

    #[test]
    fn zero_window_means_today_only() {
        let cards = vec![
            card("Today", "https://x/1", "Disponible aujourd'hui"),
            card("Tomorrow", "https://x/2", "Disponible demain"),
        ];
        let got = select(&cards, &DateParser::new(), d(2025, 3, 10), 0);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "Today");
    }

    #[test]
    fn same_name_different_url_is_kept() {
        let cards = vec![
            card("Dr A", "https://x/a1", "Prochain RDV le 12 mars 2025"),
            card("Dr A", "https://x/a2", "Prochain RDV le 12 mars 2025"),
        ];
        assert_eq!(select(&cards, &DateParser::new(), d(2025, 3, 10), 14).len(), 2);
    }

    #[test]
    fn ties_keep_page_order_and_timed_slots_sort_after_untimed() {
        let cards = vec![
            card("Second", "https://x/2", "Prochain RDV le 12 mars 2025"),
            card("Timed", "https://x/t", "Prochain RDV le 12 mars 2025 à 9h"),
            card("Third", "https://x/3", "Prochain RDV le 12 mars 2025"),
        ];
        let got = select(&cards, &DateParser::new(), d(2025, 3, 10), 14);
        let names: Vec<&str> = got.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Second", "Third", "Timed"]);
        assert_eq!(got[2].availability.time, NaiveTime::from_hms_opt(9, 0, 0));
    }

    #[test]
    fn local_today_uses_the_time_zone() {
        // 23:30 UTC on 31 March is already 1 April in Paris (UTC+2).
        let now = Utc.with_ymd_and_hms(2025, 3, 31, 23, 30, 0).unwrap();
        assert_eq!(local_today(chrono_tz::Europe::Paris, now), d(2025, 4, 1));
        assert_eq!(local_today(chrono_tz::UTC, now), d(2025, 3, 31));
    }

    #[test]
    fn console_line_format() {
        let listing = Listing {
            name: "Dr A".into(),
            url: "https://x/a".into(),
            availability: Availability::on(d(2025, 3, 12)),
        };
        assert_eq!(listing.console_line(), "2025-03-12  Dr A  https://x/a");
    }
}
