/// Generates a fresh global transaction id: a 32-character lowercase hex
/// string, the dependency-aligned substitute for the original's shortuuid
/// (not present anywhere in this workspace's dependency graph).
pub fn gen_gid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gids_are_unique_and_hex() {
        let a = gen_gid();
        let b = gen_gid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
