use std::fmt;

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("invalid calendar month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },
    #[error("range end {end} precedes start {start}")]
    EndBeforeStart { start: BillingMonth, end: BillingMonth },
}

/// key: billing-period -> calendar month targeted by a reconciliation run
///
/// Ordering is chronological. A month is represented by its first calendar
/// day whenever a date comparison is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingMonth {
    year: i32,
    month: u32,
}

impl BillingMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodError> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(PeriodError::InvalidMonth { year, month });
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        // Cannot fail: the constructor bounds year and month.
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// key: billing-period -> inclusive month range, expanded chronologically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthRange {
    start: BillingMonth,
    end: BillingMonth,
}

impl MonthRange {
    pub fn new(start: BillingMonth, end: BillingMonth) -> Result<Self, PeriodError> {
        if end < start {
            return Err(PeriodError::EndBeforeStart { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(month: BillingMonth) -> Self {
        Self {
            start: month,
            end: month,
        }
    }

    pub fn start(&self) -> BillingMonth {
        self.start
    }

    pub fn end(&self) -> BillingMonth {
        self.end
    }

    pub fn month_count(&self) -> u32 {
        let span = (self.end.year - self.start.year) * 12 + self.end.month as i32
            - self.start.month as i32;
        span as u32 + 1
    }

    /// Every month of the range in chronological order, December rolling
    /// into January of the next year.
    pub fn months(&self) -> Vec<BillingMonth> {
        let mut months = Vec::with_capacity(self.month_count() as usize);
        let mut current = self.start;
        while current <= self.end {
            months.push(current);
            current = current.next();
        }
        months
    }
}

impl fmt::Display for MonthRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}
