use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time, but never earlier than `floor`.
///
/// Wall clocks can step backwards; lifecycle timestamps must not.
pub fn now_not_before(floor: DateTime<Utc>) -> DateTime<Utc> {
    now().max(floor)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn clamps_to_future_floor() {
        let floor = now() + Duration::hours(1);
        assert_eq!(now_not_before(floor), floor);
    }

    #[test]
    fn passes_through_past_floor() {
        let floor = now() - Duration::hours(1);
        assert!(now_not_before(floor) > floor);
    }
}
