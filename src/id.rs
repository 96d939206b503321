use ulid::Ulid;

pub fn new_record_id() -> String {
    Ulid::new().to_string()
}
