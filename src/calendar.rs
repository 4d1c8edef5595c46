// ===============================
// src/calendar.rs
// ===============================
//
// Kalender sesi bursa:
// - is_open(t)   : apakah pasar buka pada instant t
// - next_open(t) : kapan pasar buka berikutnya (t sendiri kalau sedang buka)
//
// Murni: tidak ada I/O dan tidak membaca jam sistem. Caller selalu mengirim
// instant-nya sendiri (lihat ingest.rs).
//
// Resolusi aturan harian:
//   special date (jika ada)  >  weekly rule  >  tutup sepanjang hari
// Lag start/stop ditambahkan ke jam sipil sesudah aturan dipilih, termasuk
// untuk special date.
//
use ahash::AHashMap as HashMap;
use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

/// How many civil days `next_open` scans before declaring the schedule dead.
pub const LOOKAHEAD_DAYS: u32 = 366;

// Widest DST gap on record is a skipped calendar day (Samoa 2011).
const GAP_SCAN_MINUTES: i64 = 26 * 60;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("no work day within {days} days after {from}")]
    NoWorkDay { from: NaiveDate, days: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("week_day {0} is out of range 1..=7")]
    WeekdayOutOfRange(u32),
    #[error("duplicate rule for week_day {0}")]
    DuplicateWeekday(u32),
    #[error("duplicate special date {0}")]
    DuplicateDate(NaiveDate),
    #[error("lag of {0} minutes must be shorter than a day")]
    LagTooLarge(i64),
    #[error("lagged session for {day} ({start}..{stop}) is inverted or leaves its day")]
    BadWindow {
        day: String,
        start: NaiveTime,
        stop: NaiveTime,
    },
}

/// Rule for one civil day, in local time of the schedule timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRule {
    pub is_work_day: bool,
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl DayRule {
    pub fn work(start: NaiveTime, stop: NaiveTime) -> Self {
        Self { is_work_day: true, start, stop }
    }

    /// Closed all day, 00:00:00..00:00:00.
    pub fn closed() -> Self {
        Self {
            is_work_day: false,
            start: NaiveTime::MIN,
            stop: NaiveTime::MIN,
        }
    }
}

/// Immutable trading schedule. Built once at startup via [`TradingSchedule::new`],
/// which enforces the weekday/date uniqueness and window invariants.
#[derive(Debug, Clone)]
pub struct TradingSchedule {
    timezone: Tz,
    weekly: HashMap<u32, DayRule>,
    special: HashMap<NaiveDate, DayRule>,
    lag_start: Duration,
    lag_stop: Duration,
}

impl TradingSchedule {
    pub fn new(
        timezone: Tz,
        weekly: impl IntoIterator<Item = (u32, DayRule)>,
        special: impl IntoIterator<Item = (NaiveDate, DayRule)>,
        lag_start: Duration,
        lag_stop: Duration,
    ) -> Result<Self, ScheduleError> {
        for lag in [lag_start, lag_stop] {
            if lag.num_minutes().abs() >= 24 * 60 {
                return Err(ScheduleError::LagTooLarge(lag.num_minutes()));
            }
        }

        let mut weekly_map = HashMap::new();
        for (day, rule) in weekly {
            if !(1..=7).contains(&day) {
                return Err(ScheduleError::WeekdayOutOfRange(day));
            }
            check_window(&format!("week_day {day}"), &rule, lag_start, lag_stop)?;
            if weekly_map.insert(day, rule).is_some() {
                return Err(ScheduleError::DuplicateWeekday(day));
            }
        }

        let mut special_map = HashMap::new();
        for (date, rule) in special {
            check_window(&date.to_string(), &rule, lag_start, lag_stop)?;
            if special_map.insert(date, rule).is_some() {
                return Err(ScheduleError::DuplicateDate(date));
            }
        }

        Ok(Self {
            timezone,
            weekly: weekly_map,
            special: special_map,
            lag_start,
            lag_stop,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Special date replaces the weekly rule wholesale; a weekday without a
    /// rule is closed all day.
    pub fn rule_for(&self, date: NaiveDate) -> DayRule {
        if let Some(rule) = self.special.get(&date) {
            return *rule;
        }
        self.weekly
            .get(&date.weekday().number_from_monday())
            .copied()
            .unwrap_or_else(DayRule::closed)
    }

    pub fn has_work_days(&self) -> bool {
        self.weekly.values().chain(self.special.values()).any(|r| r.is_work_day)
    }
}

// Lagged window of a work day must stay inside its own civil day and keep
// start <= stop, otherwise next_open could hand back a closed instant.
fn check_window(
    day: &str,
    rule: &DayRule,
    lag_start: Duration,
    lag_stop: Duration,
) -> Result<(), ScheduleError> {
    if !rule.is_work_day {
        return Ok(());
    }
    let (start, start_wrap) = rule.start.overflowing_add_signed(lag_start);
    let (stop, stop_wrap) = rule.stop.overflowing_add_signed(lag_stop);
    if start_wrap != 0 || stop_wrap != 0 || start > stop {
        return Err(ScheduleError::BadWindow {
            day: day.to_string(),
            start: rule.start,
            stop: rule.stop,
        });
    }
    Ok(())
}

/// Session of one civil date in absolute time, lag already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub date: NaiveDate,
    pub is_work_day: bool,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl SessionWindow {
    /// Inclusive on both ends.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.is_work_day && self.start <= at && at <= self.stop
    }
}

#[derive(Debug, Clone)]
pub struct CalendarEngine {
    schedule: TradingSchedule,
}

impl CalendarEngine {
    pub fn new(schedule: TradingSchedule) -> Self {
        Self { schedule }
    }

    pub fn timezone(&self) -> Tz {
        self.schedule.timezone
    }

    /// Civil date of `at` in the schedule timezone.
    pub fn civil_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.schedule.timezone).date_naive()
    }

    /// Exchange-local wall clock for `at`.
    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.schedule.timezone).naive_local()
    }

    /// Recomputed from the schedule on every call, never cached.
    pub fn session_window(&self, date: NaiveDate) -> SessionWindow {
        let rule = self.schedule.rule_for(date);
        let start = self.localize(date.and_time(rule.start) + self.schedule.lag_start);
        let stop = self.localize(date.and_time(rule.stop) + self.schedule.lag_stop);
        SessionWindow {
            date,
            is_work_day: rule.is_work_day,
            start,
            // start dan stop bisa jatuh di gap DST yang sama
            stop: stop.max(start),
        }
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        self.session_window(self.civil_date(at)).contains(at)
    }

    /// `at` itself when open; today's lagged start when `at` is before it;
    /// otherwise the lagged start of the first work day after today.
    pub fn next_open(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, CalendarError> {
        if self.is_open(at) {
            return Ok(at);
        }

        let today = self.civil_date(at);
        let window = self.session_window(today);
        if window.is_work_day && at < window.start {
            return Ok(window.start);
        }

        let exhausted = CalendarError::NoWorkDay {
            from: today,
            days: LOOKAHEAD_DAYS,
        };
        let mut date = today;
        for _ in 0..LOOKAHEAD_DAYS {
            date = date.succ_opt().ok_or_else(|| exhausted.clone())?;
            let window = self.session_window(date);
            if window.is_work_day {
                return Ok(window.start);
            }
        }
        Err(exhausted)
    }

    // Ambiguous local time (DST fall-back) -> earlier instant.
    // Nonexistent local time (DST gap) -> first valid local minute after it,
    // i.e. the end of the gap, whatever its length.
    fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        let tz = self.schedule.timezone;
        if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
            return dt.with_timezone(&Utc);
        }
        let base = naive - Duration::seconds(i64::from(naive.second()));
        (1..=GAP_SCAN_MINUTES)
            .map(|m| base + Duration::minutes(m))
            .find_map(|t| tz.from_local_datetime(&t).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| {
                // tidak ada zona nyata dengan gap selebar ini
                let offset = tz.offset_from_utc_datetime(&naive).fix();
                Utc.from_utc_datetime(&(naive - Duration::seconds(i64::from(offset.local_minus_utc()))))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use chrono_tz::Australia::Lord_Howe;
    use chrono_tz::Europe::Moscow;
    use proptest::prelude::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    // Moscow has no DST, so local = UTC+3 all year.
    fn msk(y: i32, mo: u32, day: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Moscow
            .with_ymd_and_hms(y, mo, day, h, mi, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn weekdays(lag_start: i64, lag_stop: i64, special: Vec<(NaiveDate, DayRule)>) -> CalendarEngine {
        let weekly = (1..=5).map(|wd| (wd, DayRule::work(t(10, 0, 0), t(18, 0, 0))));
        let schedule = TradingSchedule::new(
            Moscow,
            weekly,
            special,
            Duration::minutes(lag_start),
            Duration::minutes(lag_stop),
        )
        .unwrap();
        CalendarEngine::new(schedule)
    }

    #[test]
    fn saturday_next_open_is_monday_morning() {
        // 2024-01-06 is a Saturday
        let cal = weekdays(0, 0, vec![]);
        let sat = msk(2024, 1, 6, 12, 0, 0);
        assert!(!cal.is_open(sat));
        assert_eq!(cal.next_open(sat).unwrap(), msk(2024, 1, 8, 10, 0, 0));
    }

    #[test]
    fn special_holiday_overrides_weekly_rule() {
        // 2024-01-10 is a Wednesday
        let cal = weekdays(0, 0, vec![(d(2024, 1, 10), DayRule::closed())]);
        assert!(!cal.is_open(msk(2024, 1, 10, 12, 0, 0)));
        assert!(cal.is_open(msk(2024, 1, 11, 12, 0, 0)));
        assert_eq!(
            cal.next_open(msk(2024, 1, 10, 12, 0, 0)).unwrap(),
            msk(2024, 1, 11, 10, 0, 0)
        );
    }

    #[test]
    fn special_rule_replaces_every_field() {
        let short = DayRule::work(t(11, 0, 0), t(12, 0, 0));
        let cal = weekdays(0, 0, vec![(d(2024, 1, 8), short)]);
        assert!(!cal.is_open(msk(2024, 1, 8, 10, 30, 0)));
        assert!(cal.is_open(msk(2024, 1, 8, 11, 30, 0)));
        assert!(!cal.is_open(msk(2024, 1, 8, 12, 0, 1)));
    }

    #[test]
    fn special_work_day_on_weekend() {
        let cal = weekdays(0, 0, vec![(d(2024, 1, 6), DayRule::work(t(10, 0, 0), t(14, 0, 0)))]);
        assert!(cal.is_open(msk(2024, 1, 6, 13, 0, 0)));
        assert!(!cal.is_open(msk(2024, 1, 7, 13, 0, 0)));
    }

    #[test]
    fn bounds_are_inclusive() {
        let cal = weekdays(0, 0, vec![]);
        assert!(!cal.is_open(msk(2024, 1, 8, 9, 59, 59)));
        assert!(cal.is_open(msk(2024, 1, 8, 10, 0, 0)));
        assert!(cal.is_open(msk(2024, 1, 8, 18, 0, 0)));
        assert!(!cal.is_open(msk(2024, 1, 8, 18, 0, 1)));
    }

    #[test]
    fn lags_shift_both_bounds() {
        let cal = weekdays(5, -10, vec![]);
        assert!(!cal.is_open(msk(2024, 1, 8, 10, 4, 59)));
        assert!(cal.is_open(msk(2024, 1, 8, 10, 5, 0)));
        assert!(cal.is_open(msk(2024, 1, 8, 17, 50, 0)));
        assert!(!cal.is_open(msk(2024, 1, 8, 17, 50, 1)));
    }

    #[test]
    fn lag_applies_to_special_dates_too() {
        let cal = weekdays(15, 0, vec![(d(2024, 1, 6), DayRule::work(t(10, 0, 0), t(14, 0, 0)))]);
        let fri_evening = msk(2024, 1, 5, 20, 0, 0);
        assert_eq!(cal.next_open(fri_evening).unwrap(), msk(2024, 1, 6, 10, 15, 0));
    }

    #[test]
    fn next_open_of_open_market_is_now() {
        let cal = weekdays(0, 0, vec![]);
        let now = msk(2024, 1, 9, 15, 42, 7);
        assert_eq!(cal.next_open(now).unwrap(), now);
    }

    #[test]
    fn next_open_before_todays_start() {
        let cal = weekdays(1, 0, vec![]);
        let early = msk(2024, 1, 9, 7, 0, 0);
        assert_eq!(cal.next_open(early).unwrap(), msk(2024, 1, 9, 10, 1, 0));
    }

    #[test]
    fn next_open_after_friday_close() {
        let cal = weekdays(0, 0, vec![]);
        let late = msk(2024, 1, 12, 18, 30, 0);
        assert_eq!(cal.next_open(late).unwrap(), msk(2024, 1, 15, 10, 0, 0));
    }

    #[test]
    fn schedule_without_work_days_fails() {
        let schedule = TradingSchedule::new(
            Moscow,
            (1..=7).map(|wd| (wd, DayRule::closed())),
            vec![],
            Duration::zero(),
            Duration::zero(),
        )
        .unwrap();
        assert!(!schedule.has_work_days());
        let cal = CalendarEngine::new(schedule);
        let err = cal.next_open(msk(2024, 1, 6, 12, 0, 0)).unwrap_err();
        assert_eq!(
            err,
            CalendarError::NoWorkDay {
                from: d(2024, 1, 6),
                days: LOOKAHEAD_DAYS
            }
        );
    }

    #[test]
    fn special_day_beyond_lookahead_is_not_found() {
        let far = d(2025, 3, 1);
        let schedule = TradingSchedule::new(
            Moscow,
            vec![],
            vec![(far, DayRule::work(t(10, 0, 0), t(18, 0, 0)))],
            Duration::zero(),
            Duration::zero(),
        )
        .unwrap();
        let cal = CalendarEngine::new(schedule);
        assert!(cal.next_open(msk(2024, 1, 1, 12, 0, 0)).is_err());
        assert_eq!(
            cal.next_open(msk(2024, 6, 1, 12, 0, 0)).unwrap(),
            msk(2025, 3, 1, 10, 0, 0)
        );
    }

    #[test]
    fn rejects_bad_schedules() {
        let open = DayRule::work(t(10, 0, 0), t(18, 0, 0));
        let zero = Duration::zero();

        let err = TradingSchedule::new(Moscow, vec![(8, open)], vec![], zero, zero).unwrap_err();
        assert_eq!(err, ScheduleError::WeekdayOutOfRange(8));

        let err = TradingSchedule::new(Moscow, vec![(2, open), (2, open)], vec![], zero, zero)
            .unwrap_err();
        assert_eq!(err, ScheduleError::DuplicateWeekday(2));

        let day = d(2024, 1, 1);
        let err = TradingSchedule::new(Moscow, vec![], vec![(day, open), (day, open)], zero, zero)
            .unwrap_err();
        assert_eq!(err, ScheduleError::DuplicateDate(day));

        let inverted = DayRule::work(t(18, 0, 0), t(10, 0, 0));
        assert!(matches!(
            TradingSchedule::new(Moscow, vec![(1, inverted)], vec![], zero, zero),
            Err(ScheduleError::BadWindow { .. })
        ));

        let late = DayRule::work(t(10, 0, 0), t(23, 30, 0));
        assert!(matches!(
            TradingSchedule::new(Moscow, vec![(1, late)], vec![], zero, Duration::minutes(45)),
            Err(ScheduleError::BadWindow { .. })
        ));

        assert_eq!(
            TradingSchedule::new(Moscow, vec![], vec![], Duration::hours(24), zero).unwrap_err(),
            ScheduleError::LagTooLarge(1440)
        );
    }

    #[test]
    fn dst_zone_uses_local_offsets() {
        let weekly = (1..=5).map(|wd| (wd, DayRule::work(t(9, 30, 0), t(16, 0, 0))));
        let schedule =
            TradingSchedule::new(New_York, weekly, vec![], Duration::zero(), Duration::zero())
                .unwrap();
        let cal = CalendarEngine::new(schedule);

        // Friday before the switch: EST (UTC-5)
        let fri = Utc.with_ymd_and_hms(2024, 3, 8, 14, 30, 0).unwrap();
        assert!(cal.is_open(fri));
        // Saturday -> Monday after the switch: EDT (UTC-4)
        let sat = Utc.with_ymd_and_hms(2024, 3, 9, 17, 0, 0).unwrap();
        assert_eq!(
            cal.next_open(sat).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 11, 13, 30, 0).unwrap()
        );
    }

    fn single_day(tz: Tz, date: NaiveDate, rule: DayRule) -> CalendarEngine {
        let schedule =
            TradingSchedule::new(tz, vec![], vec![(date, rule)], Duration::zero(), Duration::zero())
                .unwrap();
        CalendarEngine::new(schedule)
    }

    #[test]
    fn start_inside_dst_gap_moves_to_gap_end() {
        let cal = single_day(New_York, d(2024, 3, 10), DayRule::work(t(2, 30, 0), t(5, 0, 0)));
        let window = cal.session_window(d(2024, 3, 10));
        // 02:30 does not exist; gap ends at 03:00 EDT = 07:00Z
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap());
        assert_eq!(window.stop, Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn half_hour_gap_is_not_read_as_utc() {
        // Lord Howe jumps 02:00 -> 02:30 on 2024-10-06
        let cal = single_day(Lord_Howe, d(2024, 10, 6), DayRule::work(t(2, 10, 0), t(5, 0, 0)));
        let window = cal.session_window(d(2024, 10, 6));
        let gap_end = Lord_Howe
            .with_ymd_and_hms(2024, 10, 6, 2, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(window.start, gap_end);

        let before = Utc.with_ymd_and_hms(2024, 10, 4, 0, 0, 0).unwrap();
        assert_eq!(cal.next_open(before).unwrap(), gap_end);
        assert!(cal.is_open(gap_end));
    }

    #[test]
    fn session_entirely_inside_gap_stays_ordered() {
        let cal = single_day(New_York, d(2024, 3, 10), DayRule::work(t(2, 30, 0), t(2, 50, 0)));
        let window = cal.session_window(d(2024, 3, 10));
        assert!(window.start <= window.stop);

        let sat = Utc.with_ymd_and_hms(2024, 3, 9, 17, 0, 0).unwrap();
        let next = cal.next_open(sat).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap());
        assert!(cal.is_open(next));
    }

    // 2024-01-01T00:00:00Z plus up to roughly one year
    fn instant(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    proptest! {
        #[test]
        fn next_open_is_always_open(offset in 0i64..31_536_000, lag_start in -60i64..60, lag_stop in -60i64..60) {
            let cal = weekdays(lag_start, lag_stop, vec![(d(2024, 5, 1), DayRule::closed())]);
            let at = instant(offset);
            let next = cal.next_open(at).unwrap();
            prop_assert!(next >= at);
            prop_assert!(cal.is_open(next));
            if cal.is_open(at) {
                prop_assert_eq!(next, at);
            }
        }

        #[test]
        fn equal_lags_shift_the_window(offset in 0i64..31_536_000, lag in -120i64..120) {
            let plain = weekdays(0, 0, vec![]);
            let shifted = weekdays(lag, lag, vec![]);
            let at = instant(offset);
            prop_assert_eq!(shifted.is_open(at), plain.is_open(at - Duration::minutes(lag)));
        }
    }
}
