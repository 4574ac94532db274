//! Calendar Service: the load-bearing primitive behind session/holiday
//! annotation. No Python `exchange_calendars` binding exists for Rust, so
//! the regular-session windows, lunch breaks, and a conservative US/UK
//! holiday table are hard-coded here, behind a trait boundary — the
//! Generator and Annotator never depend on this concrete type, only on
//! `CalendarService`, so a test double can stand in without touching them.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::HashSet;

use crate::error::ErrorKind;

/// One of the ten supported equity exchanges, fixed order matches the
/// OHLC schema's session-flag column order (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Xnys,
    Xlon,
    Xswx,
    Xfra,
    Xtse,
    Xnze,
    Xtks,
    Xasx,
    Xhkg,
    Xses,
}

impl Exchange {
    pub const ALL: [Exchange; 10] = [
        Exchange::Xnys,
        Exchange::Xlon,
        Exchange::Xswx,
        Exchange::Xfra,
        Exchange::Xtse,
        Exchange::Xnze,
        Exchange::Xtks,
        Exchange::Xasx,
        Exchange::Xhkg,
        Exchange::Xses,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Exchange::Xnys => "XNYS",
            Exchange::Xlon => "XLON",
            Exchange::Xswx => "XSWX",
            Exchange::Xfra => "XFRA",
            Exchange::Xtse => "XTSE",
            Exchange::Xnze => "XNZE",
            Exchange::Xtks => "XTKS",
            Exchange::Xasx => "XASX",
            Exchange::Xhkg => "XHKG",
            Exchange::Xses => "XSES",
        }
    }

    /// The OHLC column this exchange's session flag is written to.
    pub fn column(&self) -> &'static str {
        match self {
            Exchange::Xnys => "is_nyse_session",
            Exchange::Xlon => "is_lse_session",
            Exchange::Xswx => "is_xswx_session",
            Exchange::Xfra => "is_xfra_session",
            Exchange::Xtse => "is_xtse_session",
            Exchange::Xnze => "is_xnze_session",
            Exchange::Xtks => "is_xtks_session",
            Exchange::Xasx => "is_xasx_session",
            Exchange::Xhkg => "is_xhkg_session",
            Exchange::Xses => "is_xses_session",
        }
    }

    fn session(&self) -> Session {
        match self {
            Exchange::Xnys => Session::new(chrono_tz::America::New_York, (9, 30), (16, 0), None),
            Exchange::Xlon => Session::new(chrono_tz::Europe::London, (8, 0), (16, 30), None),
            Exchange::Xswx => Session::new(chrono_tz::Europe::Zurich, (9, 0), (17, 30), None),
            Exchange::Xfra => Session::new(chrono_tz::Europe::Berlin, (8, 0), (20, 0), None),
            Exchange::Xtse => Session::new(chrono_tz::America::Toronto, (9, 30), (16, 0), None),
            Exchange::Xnze => Session::new(chrono_tz::Pacific::Auckland, (10, 0), (16, 45), None),
            Exchange::Xtks => {
                Session::new(chrono_tz::Asia::Tokyo, (9, 0), (15, 30), Some(((11, 30), (12, 30))))
            }
            Exchange::Xasx => Session::new(chrono_tz::Australia::Sydney, (10, 0), (16, 0), None),
            Exchange::Xhkg => {
                Session::new(chrono_tz::Asia::Hong_Kong, (9, 30), (16, 0), Some(((12, 0), (13, 0))))
            }
            Exchange::Xses => {
                Session::new(chrono_tz::Asia::Singapore, (9, 0), (17, 0), Some(((12, 0), (13, 0))))
            }
        }
    }
}

struct Session {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    lunch: Option<(NaiveTime, NaiveTime)>,
}

impl Session {
    fn new(tz: Tz, open: (u32, u32), close: (u32, u32), lunch: Option<((u32, u32), (u32, u32))>) -> Self {
        Self {
            tz,
            open: NaiveTime::from_hms_opt(open.0, open.1, 0).expect("valid time"),
            close: NaiveTime::from_hms_opt(close.0, close.1, 0).expect("valid time"),
            lunch: lunch.map(|(a, b)| {
                (
                    NaiveTime::from_hms_opt(a.0, a.1, 0).expect("valid time"),
                    NaiveTime::from_hms_opt(b.0, b.1, 0).expect("valid time"),
                )
            }),
        }
    }
}

/// Calendars that the Annotator asks holiday questions against. "Major" is
/// the logical OR of US and UK, computed by the caller, not stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolidayCalendar {
    Us,
    Uk,
}

/// Pure, stateless capability: answers trading-minute and holiday
/// questions. Implementations must honor DST via an IANA zone database,
/// never manual UTC-offset arithmetic.
pub trait CalendarService: Send + Sync {
    fn is_trading_minute(&self, exchange: Exchange, instant_utc: DateTime<Utc>) -> Result<bool, ErrorKind>;
    fn is_holiday(&self, calendar: HolidayCalendar, date_local: NaiveDate) -> Result<bool, ErrorKind>;
}

/// Earliest/latest year for which the hard-coded holiday tables below are
/// considered authoritative; outside this range calendar answers are
/// refused rather than guessed (spec: "no heuristic fallback").
const SUPPORTED_YEARS: std::ops::RangeInclusive<i32> = 1970..=2100;

/// Production `CalendarService`. Session windows are exact (spec §4.4);
/// holiday tables are a conservative, hand-authored subset of the real
/// NYSE/LSE closure calendars (fixed-date and floating federal/bank
/// holidays with standard weekend-observed shifts), not an exhaustive
/// maintained feed — see DESIGN.md.
#[derive(Debug, Default)]
pub struct DefaultCalendar;

impl CalendarService for DefaultCalendar {
    fn is_trading_minute(&self, exchange: Exchange, instant_utc: DateTime<Utc>) -> Result<bool, ErrorKind> {
        let session = exchange.session();
        let local = instant_utc.with_timezone(&session.tz);
        let local_date = local.date_naive();
        if !SUPPORTED_YEARS.contains(&local_date.year()) {
            return Err(ErrorKind::CalendarUnavailable {
                exchange_or_calendar: exchange.code().to_string(),
                reason: format!("year {} outside supported range", local_date.year()),
            });
        }
        if matches!(local_date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Ok(false);
        }
        if exchange_holidays(exchange, local_date.year()).contains(&local_date) {
            return Ok(false);
        }
        let t = local.time();
        if t < session.open || t >= session.close {
            return Ok(false);
        }
        if let Some((lunch_start, lunch_end)) = session.lunch {
            if t >= lunch_start && t < lunch_end {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_holiday(&self, calendar: HolidayCalendar, date_local: NaiveDate) -> Result<bool, ErrorKind> {
        if !SUPPORTED_YEARS.contains(&date_local.year()) {
            return Err(ErrorKind::CalendarUnavailable {
                exchange_or_calendar: format!("{calendar:?}"),
                reason: format!("year {} outside supported range", date_local.year()),
            });
        }
        let set = match calendar {
            HolidayCalendar::Us => us_holidays(date_local.year()),
            HolidayCalendar::Uk => uk_holidays(date_local.year()),
        };
        Ok(set.contains(&date_local))
    }
}

/// Holidays observed by a given exchange, used only for the
/// trading-minute primitive. XNYS/XLON reuse the richer US/UK tables;
/// the remaining eight exchanges get a minimal fixed-date table
/// (New Year's Day, Christmas Day, Good Friday), documented as a known
/// simplification rather than an authoritative feed.
fn exchange_holidays(exchange: Exchange, year: i32) -> HashSet<NaiveDate> {
    match exchange {
        Exchange::Xnys => us_holidays(year),
        Exchange::Xlon => uk_holidays(year),
        _ => {
            let mut set = HashSet::new();
            set.insert(observed_us_style(NaiveDate::from_ymd_opt(year, 1, 1).unwrap()));
            set.insert(observed_us_style(NaiveDate::from_ymd_opt(year, 12, 25).unwrap()));
            set.insert(good_friday(year));
            set
        }
    }
}

fn us_holidays(year: i32) -> HashSet<NaiveDate> {
    let mut set = HashSet::new();
    set.insert(observed_us_style(ymd(year, 1, 1)));
    set.insert(nth_weekday_of_month(year, 1, Weekday::Mon, 3)); // MLK Day
    set.insert(nth_weekday_of_month(year, 2, Weekday::Mon, 3)); // Washington's Birthday
    set.insert(good_friday(year));
    set.insert(last_weekday_of_month(year, 5, Weekday::Mon)); // Memorial Day
    set.insert(observed_us_style(ymd(year, 6, 19))); // Juneteenth
    set.insert(observed_us_style(ymd(year, 7, 4))); // Independence Day
    set.insert(nth_weekday_of_month(year, 9, Weekday::Mon, 1)); // Labor Day
    set.insert(nth_weekday_of_month(year, 11, Weekday::Thu, 4)); // Thanksgiving
    set.insert(observed_us_style(ymd(year, 12, 25)));
    set
}

fn uk_holidays(year: i32) -> HashSet<NaiveDate> {
    let easter = easter_sunday(year);
    let mut set = HashSet::new();
    set.insert(observed_uk_style(ymd(year, 1, 1)));
    set.insert(easter - chrono::Duration::days(2)); // Good Friday
    set.insert(easter + chrono::Duration::days(1)); // Easter Monday
    set.insert(nth_weekday_of_month(year, 5, Weekday::Mon, 1)); // Early May bank holiday
    set.insert(last_weekday_of_month(year, 5, Weekday::Mon)); // Spring bank holiday
    set.insert(last_weekday_of_month(year, 8, Weekday::Mon)); // Summer bank holiday
    set.insert(observed_uk_style(ymd(year, 12, 25)));
    set.insert(observed_uk_boxing_day(year));
    set
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date")
}

/// US convention: Saturday shifts to the preceding Friday, Sunday shifts
/// to the following Monday.
fn observed_us_style(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - chrono::Duration::days(1),
        Weekday::Sun => date + chrono::Duration::days(1),
        _ => date,
    }
}

/// UK convention: a weekend fixed holiday shifts to the next weekday.
fn observed_uk_style(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date + chrono::Duration::days(2),
        Weekday::Sun => date + chrono::Duration::days(1),
        _ => date,
    }
}

/// Boxing Day (Dec 26) shifts clear of a weekend *and* clear of a shifted
/// Christmas Day, landing on Dec 27 when Dec 25 falls on a Saturday.
fn observed_uk_boxing_day(year: i32) -> NaiveDate {
    let boxing = ymd(year, 12, 26);
    match boxing.weekday() {
        Weekday::Sat => boxing + chrono::Duration::days(2),
        Weekday::Sun => boxing + chrono::Duration::days(1),
        Weekday::Mon if ymd(year, 12, 25).weekday() == Weekday::Sat => boxing + chrono::Duration::days(1),
        _ => boxing,
    }
}

/// The Nth occurrence of `weekday` in `month` of `year` (1-indexed).
fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = ymd(year, month, 1);
    let offset = (7 + weekday.num_days_from_monday() as i64 - first.weekday().num_days_from_monday() as i64) % 7;
    first + chrono::Duration::days(offset + 7 * (n as i64 - 1))
}

/// The last occurrence of `weekday` in `month` of `year`.
fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month_first = if month == 12 {
        ymd(year + 1, 1, 1)
    } else {
        ymd(year, month + 1, 1)
    };
    let last_day = next_month_first - chrono::Duration::days(1);
    let back = (7 + last_day.weekday().num_days_from_monday() as i64 - weekday.num_days_from_monday() as i64) % 7;
    last_day - chrono::Duration::days(back)
}

/// Anonymous Gregorian algorithm for the date of Easter Sunday.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    ymd(year, month as u32, day as u32)
}

fn good_friday(year: i32) -> NaiveDate {
    easter_sunday(year) - chrono::Duration::days(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn tokyo_lunch_is_not_a_trading_minute() {
        let cal = DefaultCalendar;
        // 2024-08-05 is a Monday. Tokyo noon local = 2024-08-05T03:00:00Z.
        let noon_utc = Utc.with_ymd_and_hms(2024, 8, 5, 3, 0, 0).unwrap();
        assert!(!cal.is_trading_minute(Exchange::Xtks, noon_utc).unwrap());
        // 10:45 local (within session, outside lunch) = 01:45 UTC.
        let mid_morning = Utc.with_ymd_and_hms(2024, 8, 5, 1, 45, 0).unwrap();
        assert!(cal.is_trading_minute(Exchange::Xtks, mid_morning).unwrap());
    }

    #[test]
    fn weekend_is_never_a_trading_minute() {
        let cal = DefaultCalendar;
        // 2024-08-03 is a Saturday.
        let sat = Utc.with_ymd_and_hms(2024, 8, 3, 15, 0, 0).unwrap();
        assert!(!cal.is_trading_minute(Exchange::Xnys, sat).unwrap());
    }

    #[test]
    fn nyse_closed_on_independence_day() {
        let cal = DefaultCalendar;
        let july4_noon = Utc.with_ymd_and_hms(2024, 7, 4, 16, 0, 0).unwrap();
        assert!(!cal.is_trading_minute(Exchange::Xnys, july4_noon).unwrap());
    }

    #[test]
    fn us_holiday_independence_day_observed_on_weekday() {
        let cal = DefaultCalendar;
        assert!(cal.is_holiday(HolidayCalendar::Us, ymd(2024, 7, 4)).unwrap());
    }

    #[test]
    fn major_holiday_is_union_of_us_and_uk() {
        let cal = DefaultCalendar;
        // Independence Day is a US holiday but not a UK one.
        let us_only = ymd(2024, 7, 4);
        let is_us = cal.is_holiday(HolidayCalendar::Us, us_only).unwrap();
        let is_uk = cal.is_holiday(HolidayCalendar::Uk, us_only).unwrap();
        assert!(is_us && !is_uk);
    }

    #[test]
    fn dst_spring_forward_produces_no_duplicate_minute() {
        let cal = DefaultCalendar;
        // US DST 2024 starts 2024-03-10 02:00 local -> clocks jump to 03:00.
        // 06:30 UTC = 01:30 EST (pre-jump); 07:30 UTC = 03:30 EDT (post-jump).
        // Both map to distinct, unambiguous UTC instants.
        let before = Utc.with_ymd_and_hms(2024, 3, 10, 6, 30, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap();
        assert_ne!(
            cal.is_trading_minute(Exchange::Xnys, before).unwrap(),
            cal.is_trading_minute(Exchange::Xnys, after).unwrap()
        );
    }

    #[test]
    fn easter_sunday_known_dates() {
        assert_eq!(easter_sunday(2024), ymd(2024, 3, 31));
        assert_eq!(easter_sunday(2025), ymd(2025, 4, 20));
    }
}

/// Test double used by unit tests for the Generator/Annotator that don't
/// want to depend on the hard-coded production tables.
#[cfg(test)]
pub struct FixtureCalendar {
    pub trading_minutes: HashSet<(Exchange, DateTime<Utc>)>,
    pub holidays: HashSet<(HolidayCalendar, NaiveDate)>,
}

#[cfg(test)]
impl CalendarService for FixtureCalendar {
    fn is_trading_minute(&self, exchange: Exchange, instant_utc: DateTime<Utc>) -> Result<bool, ErrorKind> {
        Ok(self.trading_minutes.contains(&(exchange, instant_utc)))
    }

    fn is_holiday(&self, calendar: HolidayCalendar, date_local: NaiveDate) -> Result<bool, ErrorKind> {
        Ok(self.holidays.contains(&(calendar, date_local)))
    }
}
