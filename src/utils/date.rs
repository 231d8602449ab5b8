//! Time formatting helpers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use chrono::{DateTime, Local, Utc};
use chrono::format::{Item, Numeric, Pad};

//------------ now_unix -------------------------------------------------------

/// Returns the current time as whole seconds since the Unix epoch.
///
/// Used throughout the cache and results journal, both of which store
/// timestamps as plain numbers rather than RFC 3339 strings.
pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs()
}

//------------ Constructing ISO Dates ----------------------------------------

const LOCAL_ISO_DATE: &[Item<'static>] = &[
    Item::Numeric(Numeric::Year, Pad::Zero),
    Item::Literal("-"),
    Item::Numeric(Numeric::Month, Pad::Zero),
    Item::Literal("-"),
    Item::Numeric(Numeric::Day, Pad::Zero),
    Item::Literal("T"),
    Item::Numeric(Numeric::Hour, Pad::Zero),
    Item::Literal(":"),
    Item::Numeric(Numeric::Minute, Pad::Zero),
    Item::Literal(":"),
    Item::Numeric(Numeric::Second, Pad::Zero),
];

pub fn format_local_iso_date(date: DateTime<Local>) -> impl fmt::Display {
    date.format_with_items(LOCAL_ISO_DATE.iter())
}

pub fn format_iso_date(date: DateTime<Utc>) -> impl fmt::Display {
    date.format_with_items(LOCAL_ISO_DATE.iter())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_unix_is_reasonable() {
        // Sanity bound: some time after this crate was written.
        assert!(now_unix() > 1_700_000_000);
    }
}
