/*
 * Time
 *
 * Guest time is counted in time-base ticks. The console's bus runs at
 * 248,625,000 Hz and the time base increments at a quarter of that.
 * `system_time` is ticks since power-on (time base minus the base time
 * captured at boot); `time` is ticks since the 2000-01-01 epoch.
 */

use crate::guest::GuestMemory;
use crate::Kernel;

pub type OsTime = i64;
pub type OsTick = i32;

pub const BUS_CLOCK: i64 = 248_625_000;
pub const TIMER_CLOCK: i64 = BUS_CLOCK / 4;

guest_struct! {
    /// POSIX `tm` plus millisecond/microsecond fields, no `tm_isdst`.
    pub struct OsCalendarTime : 0x28 {
        0x00 => sec, set_sec: i32;
        0x04 => min, set_min: i32;
        0x08 => hour, set_hour: i32;
        0x0C => mday, set_mday: i32;
        0x10 => mon, set_mon: i32;
        0x14 => year, set_year: i32;
        0x18 => wday, set_wday: i32;
        0x1C => yday, set_yday: i32;
        0x20 => msec, set_msec: i32;
        0x24 => usec, set_usec: i32;
    }
}

// The timer clock is not an integer multiple of 1 kHz, so every
// conversion widens to 128 bits instead of pre-dividing the clock.

pub fn ms_to_ticks(ms: i64) -> OsTime {
    ((ms as i128 * TIMER_CLOCK as i128) / 1000) as i64
}

pub fn us_to_ticks(us: i64) -> OsTime {
    ((us as i128 * TIMER_CLOCK as i128) / 1_000_000) as i64
}

pub fn ns_to_ticks(ns: i64) -> OsTime {
    ((ns as i128 * TIMER_CLOCK as i128) / 1_000_000_000) as i64
}

pub fn ticks_to_ms(ticks: OsTime) -> i64 {
    ((ticks as i128 * 1000) / TIMER_CLOCK as i128) as i64
}

pub fn ticks_to_ns(ticks: OsTime) -> i64 {
    ((ticks as i128 * 1_000_000_000) / TIMER_CLOCK as i128) as i64
}

const DAYS_TO_MONTH: [i32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_year(year: i32) -> i64 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

impl Kernel {
    /// Ticks since the epoch.
    pub fn time(&self) -> OsTime {
        self.cpu().time_base()
    }

    /// Ticks since boot.
    pub fn system_time(&self) -> OsTime {
        self.cpu().time_base() - self.base_time()
    }

    pub fn tick(&self) -> OsTick {
        self.time() as OsTick
    }

    pub fn system_tick(&self) -> OsTick {
        self.system_time() as OsTick
    }

    /// Break a tick count since the 2000-01-01 epoch into calendar fields.
    pub fn ticks_to_calendar_time(&self, time: OsTime, out: OsCalendarTime) {
        let mem = self.mem();
        ticks_to_calendar_time(mem, time, out)
    }

    pub fn calendar_time_to_ticks(&self, ct: OsCalendarTime) -> OsTime {
        calendar_time_to_ticks(self.mem(), ct)
    }
}

pub fn ticks_to_calendar_time(mem: &GuestMemory, time: OsTime, out: OsCalendarTime) {
    let total_us = ticks_to_ns(time) / 1000;
    let mut days = total_us.div_euclid(86_400_000_000);
    let us_of_day = total_us.rem_euclid(86_400_000_000);

    out.set_usec(mem, (us_of_day % 1000) as i32);
    out.set_msec(mem, ((us_of_day / 1000) % 1000) as i32);
    let secs = us_of_day / 1_000_000;
    out.set_sec(mem, (secs % 60) as i32);
    out.set_min(mem, ((secs / 60) % 60) as i32);
    out.set_hour(mem, (secs / 3600) as i32);

    // 2000-01-01 was a Saturday
    out.set_wday(mem, ((days + 6).rem_euclid(7)) as i32);

    let mut year = 2000;
    loop {
        let n = days_in_year(year);
        if days >= n {
            days -= n;
            year += 1;
        } else if days < 0 {
            year -= 1;
            days += days_in_year(year);
        } else {
            break;
        }
    }
    out.set_year(mem, year);
    out.set_yday(mem, days as i32);

    let leap = if is_leap_year(year) { 1 } else { 0 };
    let mut mon = 11;
    while mon > 0 {
        let first = DAYS_TO_MONTH[mon as usize] as i64 + if mon >= 2 { leap } else { 0 };
        if days >= first {
            break;
        }
        mon -= 1;
    }
    let first = DAYS_TO_MONTH[mon as usize] as i64 + if mon >= 2 { leap } else { 0 };
    out.set_mon(mem, mon);
    out.set_mday(mem, (days - first + 1) as i32);
}

pub fn calendar_time_to_ticks(mem: &GuestMemory, ct: OsCalendarTime) -> OsTime {
    let year = ct.year(mem);
    let mon = ct.mon(mem);

    let mut days: i64 = 0;
    if year >= 2000 {
        for y in 2000..year {
            days += days_in_year(y);
        }
    } else {
        for y in year..2000 {
            days -= days_in_year(y);
        }
    }

    let leap = if is_leap_year(year) && mon >= 2 { 1 } else { 0 };
    days += DAYS_TO_MONTH[mon.clamp(0, 11) as usize] as i64 + leap;
    days += ct.mday(mem) as i64 - 1;

    let mut us = days * 86_400_000_000;
    us += ct.hour(mem) as i64 * 3_600_000_000;
    us += ct.min(mem) as i64 * 60_000_000;
    us += ct.sec(mem) as i64 * 1_000_000;
    us += ct.msec(mem) as i64 * 1000;
    us += ct.usec(mem) as i64;

    ns_to_ticks(us * 1000)
}
