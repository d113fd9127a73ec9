pub mod time;

/// Random 128-bit identifier, used for runs and agent runs.
pub fn longid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Short url-safe identifier, used for approvals, events and schedules.
pub fn shortid() -> String {
    nanoid::nanoid!(12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(longid(), longid());
        assert_eq!(longid().len(), 32);
        assert_eq!(shortid().len(), 12);
    }
}
