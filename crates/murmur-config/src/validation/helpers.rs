//! Range check shared by every section validator.

use std::fmt::Display;
use std::ops::RangeInclusive;

/// Record `name` as a problem unless `value` lies in `allowed`.
pub(crate) fn check_range<T>(problems: &mut Vec<String>, name: &str, value: T, allowed: RangeInclusive<T>)
where
    T: PartialOrd + Display,
{
    if !allowed.contains(&value) {
        problems.push(format!(
            "{name} = {value} is out of range [{}, {}]",
            allowed.start(),
            allowed.end()
        ));
    }
}
