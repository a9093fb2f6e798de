use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use regex::{Captures, Regex};
use serde::Serialize;

// ======================================================
// TYPES
// ======================================================

/// A next-availability day, in the search's local time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Availability {
    pub date: NaiveDate,
    /// Present only when the card states an hour.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<NaiveTime>,
}

impl Availability {
    pub fn on(date: NaiveDate) -> Self {
        Self { date, time: None }
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.time {
            Some(t) => write!(f, "{} {}", self.date.format("%Y-%m-%d"), t.format("%H:%M")),
            None    => write!(f, "{}", self.date.format("%Y-%m-%d")),
        }
    }
}

// ======================================================
// PATTERNS
// ======================================================

const WEEKDAY: &str =
    r"(?:(?:lundi|mardi|mercredi|jeudi|vendredi|samedi|dimanche|lun|mar|mer|jeu|ven|sam|dim)\.?\s+)?";
const DATE: &str = r"(?P<day>[0-9]{1,2})(?:er)?\s+(?P<month>\p{L}+)\.?(?:\s+(?P<year>[0-9]{4})\b)?";
const TIME: &str = r"(?:\s+(?:à\s+)?(?P<hour>[0-9]{1,2})\s*[h:]\s*(?P<minute>[0-9]{2})?)?";

/// Leading phrases, tried in order. Each is followed by the same date body.
const LEADS: [&str; 2] = [
    r"prochain(?:\s+rdv|\s+rendez-vous)?\s*(?:le)?\s*",
    r"disponibilit[ée]s?\s*(?:le)?\s*",
];

/// Parses the French "next availability" phrases found on practitioner cards.
#[derive(Debug, Clone)]
pub struct DateParser {
    phrases: Vec<Regex>,
    today: Regex,
    after_tomorrow: Regex,
    tomorrow: Regex,
}

impl Default for DateParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DateParser {
    pub fn new() -> Self {
        let phrases = LEADS
            .iter()
            .map(|lead| {
                Regex::new(&format!("(?i){}{}{}{}", lead, WEEKDAY, DATE, TIME)).expect("valid regex")
            })
            .collect();

        Self {
            phrases,
            today: Regex::new(r"(?i)\baujourd['’]hui\b").expect("valid regex"),
            after_tomorrow: Regex::new(r"(?i)\bapr[eè]s[- ]demain\b").expect("valid regex"),
            tomorrow: Regex::new(r"(?i)\bdemain\b").expect("valid regex"),
        }
    }

    /// Find the first availability stated in `text`, relative to `today`.
    ///
    /// Dated phrases win over relative words. A phrase whose date cannot be
    /// built (unknown month, 31 February) falls through to the next phrase kind.
    pub fn parse(&self, text: &str, today: NaiveDate) -> Option<Availability> {
        for re in &self.phrases {
            let Some(caps) = re.captures(text) else {
                continue;
            };
            if let Some(found) = build(&caps, today) {
                return Some(found);
            }
        }

        if self.today.is_match(text) {
            return Some(Availability::on(today));
        }
        if self.after_tomorrow.is_match(text) {
            return Some(Availability::on(today + Duration::days(2)));
        }
        if self.tomorrow.is_match(text) {
            return Some(Availability::on(today + Duration::days(1)));
        }

        None
    }
}

// ======================================================
// HELPERS
// ======================================================

fn build(caps: &Captures<'_>, today: NaiveDate) -> Option<Availability> {
    let day: u32 = caps.name("day")?.as_str().parse().ok()?;
    let month = month_number(caps.name("month")?.as_str())?;

    let date = match caps.name("year") {
        Some(y) => NaiveDate::from_ymd_opt(y.as_str().parse().ok()?, month, day)?,
        None => resolve_yearless(day, month, today)?,
    };

    let time = caps.name("hour").and_then(|h| {
        let hour: u32 = h.as_str().parse().ok()?;
        let minute: u32 = match caps.name("minute") {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        NaiveTime::from_hms_opt(hour, minute, 0)
    });

    Some(Availability { date, time })
}

/// Current year, unless that day is already behind us.
fn resolve_yearless(day: u32, month: u32, today: NaiveDate) -> Option<NaiveDate> {
    match NaiveDate::from_ymd_opt(today.year(), month, day) {
        Some(date) if date >= today => Some(date),
        _ => NaiveDate::from_ymd_opt(today.year() + 1, month, day),
    }
}

pub fn month_number(word: &str) -> Option<u32> {
    let m = match word.trim_end_matches('.').to_lowercase().as_str() {
        "janvier" | "janv" => 1,
        "février" | "fevrier" | "févr" | "fevr" | "fév" | "fev" => 2,
        "mars" => 3,
        "avril" | "avr" => 4,
        "mai" => 5,
        "juin" => 6,
        "juillet" | "juil" => 7,
        "août" | "aout" => 8,
        "septembre" | "sept" => 9,
        "octobre" | "oct" => 10,
        "novembre" | "nov" => 11,
        "décembre" | "decembre" | "déc" | "dec" => 12,
        _ => return None,
    };
    Some(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn parse(text: &str, today: NaiveDate) -> Option<Availability> {
        DateParser::new().parse(text, today)
    }

    #[test]
    fn prochain_rdv_with_year() {
        let got = parse("Dr Martin Dermatologue Prochain RDV le 12 mars 2025", d(2025, 3, 1));
        assert_eq!(got, Some(Availability::on(d(2025, 3, 12))));
    }

    #[test]
    fn prochain_rendez_vous_without_year_uses_current_year() {
        let got = parse("Prochain rendez-vous le 5 avril", d(2025, 3, 20));
        assert_eq!(got, Some(Availability::on(d(2025, 4, 5))));
    }

    #[test]
    fn yearless_date_in_the_past_rolls_to_next_year() {
        let got = parse("Prochain RDV le 3 janvier", d(2025, 12, 20));
        assert_eq!(got, Some(Availability::on(d(2026, 1, 3))));
    }

    #[test]
    fn yearless_date_today_stays_this_year() {
        let got = parse("Prochain RDV le 20 décembre", d(2025, 12, 20));
        assert_eq!(got, Some(Availability::on(d(2025, 12, 20))));
    }

    #[test]
    fn postcode_after_date_is_not_a_year() {
        let got = parse("Prochain RDV le 12 mars 31000 Toulouse", d(2025, 3, 10));
        assert_eq!(got, Some(Availability::on(d(2025, 3, 12))));

        let got = parse("Disponibilités le 14 mars 75015 Paris", d(2025, 3, 10));
        assert_eq!(got, Some(Availability::on(d(2025, 3, 14))));
    }

    #[test]
    fn disponibilites_phrase() {
        let got = parse("Disponibilités le 18 juin 2025 en cabinet", d(2025, 6, 1));
        assert_eq!(got, Some(Availability::on(d(2025, 6, 18))));

        let got = parse("Disponibilite 2 aout", d(2025, 6, 1));
        assert_eq!(got, Some(Availability::on(d(2025, 8, 2))));
    }

    #[test]
    fn case_and_accents_are_ignored() {
        let got = parse("PROCHAIN RDV LE 7 FÉVRIER 2026", d(2026, 1, 10));
        assert_eq!(got, Some(Availability::on(d(2026, 2, 7))));
    }

    #[test]
    fn weekday_ordinal_and_abbreviation() {
        let got = parse("Prochain RDV le mardi 1er sept.", d(2025, 8, 1));
        assert_eq!(got, Some(Availability::on(d(2025, 9, 1))));

        let got = parse("Prochain RDV le jeu. 11 déc. 2025", d(2025, 12, 1));
        assert_eq!(got, Some(Availability::on(d(2025, 12, 11))));
    }

    #[test]
    fn stated_hour_is_kept() {
        let got = parse("Prochain RDV le 12 mars à 14h30", d(2025, 3, 1)).unwrap();
        assert_eq!(got.date, d(2025, 3, 12));
        assert_eq!(got.time, NaiveTime::from_hms_opt(14, 30, 0));

        let got = parse("Prochain RDV le 12 mars 2025 à 9h", d(2025, 3, 1)).unwrap();
        assert_eq!(got.time, NaiveTime::from_hms_opt(9, 0, 0));
    }

    #[test]
    fn impossible_hour_keeps_the_date() {
        let got = parse("Prochain RDV le 12 mars à 27h", d(2025, 3, 1)).unwrap();
        assert_eq!(got, Availability::on(d(2025, 3, 12)));
    }

    #[test]
    fn invalid_date_falls_through_to_next_phrase() {
        let text = "Prochain RDV le 31 février 2025 — Disponibilités le 4 mars 2025";
        assert_eq!(parse(text, d(2025, 2, 1)), Some(Availability::on(d(2025, 3, 4))));
    }

    #[test]
    fn unknown_month_word_falls_through_to_relative() {
        let text = "Prochain RDV le 12 prochains jours, sinon demain";
        assert_eq!(parse(text, d(2025, 5, 5)), Some(Availability::on(d(2025, 5, 6))));
    }

    #[test]
    fn relative_words() {
        let today = d(2025, 5, 5);
        assert_eq!(parse("Disponible aujourd'hui", today), Some(Availability::on(today)));
        assert_eq!(parse("Disponible aujourd’hui", today), Some(Availability::on(today)));
        assert_eq!(parse("Disponible demain", today), Some(Availability::on(d(2025, 5, 6))));
        assert_eq!(parse("Disponible après-demain", today), Some(Availability::on(d(2025, 5, 7))));
    }

    #[test]
    fn dated_phrase_beats_relative_word() {
        let text = "Pas de créneau demain. Prochain RDV le 9 mai 2025";
        assert_eq!(parse(text, d(2025, 5, 5)), Some(Availability::on(d(2025, 5, 9))));
    }

    #[test]
    fn no_phrase_means_none() {
        assert_eq!(parse("Dr Dupont, Dermatologue, 31000 Toulouse", d(2025, 5, 5)), None);
        assert_eq!(parse("", d(2025, 5, 5)), None);
    }

    #[test]
    fn month_table() {
        assert_eq!(month_number("Août"), Some(8));
        assert_eq!(month_number("aout"), Some(8));
        assert_eq!(month_number("janv."), Some(1));
        assert_eq!(month_number("March"), None);
    }

    #[test]
    fn display_includes_time_only_when_known() {
        assert_eq!(Availability::on(d(2025, 3, 12)).to_string(), "2025-03-12");
        let with_time = Availability {
            date: d(2025, 3, 12),
            time: NaiveTime::from_hms_opt(8, 5, 0),
        };
        assert_eq!(with_time.to_string(), "2025-03-12 08:05");
    }
}
