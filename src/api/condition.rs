use chrono::{DateTime, Utc};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Placeholder transition time; [`set_status_condition`] replaces it with the current time.
pub fn unset_time() -> Time {
    Time(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn new_condition(
    type_: impl Into<String>,
    status: bool,
    reason: impl Into<String>,
    message: impl Into<String>,
) -> Condition {
    Condition {
        type_: type_.into(),
        status: if status { CONDITION_TRUE } else { CONDITION_FALSE }.to_string(),
        reason: reason.into(),
        message: message.into(),
        last_transition_time: unset_time(),
        observed_generation: None,
    }
}

pub fn is_condition_true(condition: &Condition) -> bool {
    condition.status == CONDITION_TRUE
}

pub fn find_status_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_status_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_status_condition(conditions, type_).is_some_and(is_condition_true)
}

/// Inserts or updates `new` by type and returns the stored condition.
///
/// The transition time only moves when the status flips. An unset time on `new` becomes `now`.
pub fn set_status_condition(conditions: &mut Vec<Condition>, mut new: Condition, now: Time) -> Condition {
    if new.last_transition_time == unset_time() {
        new.last_transition_time = now;
    }
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status || existing.last_transition_time == unset_time() {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
            existing.clone()
        }
        None => {
            conditions.push(new.clone());
            new
        }
    }
}
