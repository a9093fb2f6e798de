use chrono::{Datelike, Timelike, Weekday};

use crate::scan::Listing;

/// What the message is announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// The current list (possibly empty) in always mode.
    Current,
    /// Change-only mode: the list changed and is now empty.
    NoLongerAvailable,
    /// Change-only mode: nothing before, nothing now, and empty notices are on.
    NothingDetected,
}

/// Everything the renderer needs besides the listings.
#[derive(Debug, Clone)]
pub struct Heading {
    pub specialty: String,
    pub city: String,
    pub window_days: u32,
}

pub fn render(kind: MessageKind, heading: &Heading, listings: &[Listing]) -> String {
    let n = heading.window_days;

    match kind {
        MessageKind::NothingDetected => {
            format!("Aucune dispo détectée pour les {} prochains jours.", n)
        }
        MessageKind::NoLongerAvailable if listings.is_empty() => {
            format!("Plus de disponibilité ≤ {} jours pour le moment.", n)
        }
        MessageKind::Current if listings.is_empty() => {
            format!("Aucune disponibilité ≤ {} jours.", n)
        }
        _ => {
            let mut lines = vec![format!(
                "🩺 {}s avec RDV ≤ {} jours ({}):",
                capitalize(&heading.specialty),
                n,
                capitalize(&heading.city)
            )];
            lines.extend(listings.iter().map(entry));
            lines.join("\n")
        }
    }
}

/// `• name — Mer 12/03 à 14h\n  url`
fn entry(listing: &Listing) -> String {
    let a = &listing.availability;
    let hour = match a.time {
        Some(t) if t.hour() != 0 || t.minute() != 0 => format!(" à {}h", t.format("%H")),
        _ => String::new(),
    };

    format!(
        "• {} — {} {}{}\n  {}",
        listing.name,
        weekday_fr(a.date.weekday()),
        a.date.format("%d/%m"),
        hour,
        listing.url
    )
}

pub fn weekday_fr(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Lun",
        Weekday::Tue => "Mar",
        Weekday::Wed => "Mer",
        Weekday::Thu => "Jeu",
        Weekday::Fri => "Ven",
        Weekday::Sat => "Sam",
        Weekday::Sun => "Dim",
    }
}

/// Title-case each word of a slug: `saint-etienne` → `Saint-Etienne`.
fn capitalize(slug: &str) -> String {
    let mut out = String::with_capacity(slug.len());
    let mut start = true;
    for ch in slug.trim().chars() {
        if start {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        start = ch == '-' || ch == ' ';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::Availability;
    use chrono::{NaiveDate, NaiveTime};

    fn heading() -> Heading {
        Heading {
            specialty: "dermatologue".into(),
            city: "toulouse".into(),
            window_days: 14,
        }
    }

    fn listing(name: &str, day: u32, time: Option<NaiveTime>) -> Listing {
        Listing {
            name: name.into(),
            url: format!("https://www.doctolib.fr/dermatologue/toulouse/{}", name.to_lowercase()),
            availability: Availability {
                date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
                time,
            },
        }
    }

    #[test]
    fn renders_header_and_entries() {
        let listings = vec![
            listing("Martin", 12, None),
            listing("Durand", 14, NaiveTime::from_hms_opt(14, 30, 0)),
        ];
        let msg = render(MessageKind::Current, &heading(), &listings);

        let expected = "🩺 Dermatologues avec RDV ≤ 14 jours (Toulouse):\n\
                        • Martin — Mer 12/03\n  https://www.doctolib.fr/dermatologue/toulouse/martin\n\
                        • Durand — Ven 14/03 à 14h\n  https://www.doctolib.fr/dermatologue/toulouse/durand";
        assert_eq!(msg, expected);
    }

    #[test]
    fn midnight_is_treated_as_no_hour() {
        let listings = vec![listing("Martin", 12, NaiveTime::from_hms_opt(0, 0, 0))];
        let msg = render(MessageKind::Current, &heading(), &listings);
        assert!(msg.contains("Mer 12/03\n"));
        assert!(!msg.contains(" à "));
    }

    #[test]
    fn empty_messages() {
        assert_eq!(
            render(MessageKind::Current, &heading(), &[]),
            "Aucune disponibilité ≤ 14 jours."
        );
        assert_eq!(
            render(MessageKind::NoLongerAvailable, &heading(), &[]),
            "Plus de disponibilité ≤ 14 jours pour le moment."
        );
        assert_eq!(
            render(MessageKind::NothingDetected, &heading(), &[]),
            "Aucune dispo détectée pour les 14 prochains jours."
        );
    }

    #[test]
    fn capitalizes_compound_city() {
        let heading = Heading {
            specialty: "ophtalmologue".into(),
            city: "saint-etienne".into(),
            window_days: 7,
        };
        let msg = render(MessageKind::Current, &heading, &[listing("Roux", 12, None)]);
        assert!(msg.starts_with("🩺 Ophtalmologues avec RDV ≤ 7 jours (Saint-Etienne):"));
    }
}
