//! Group-based authorization checks.

use std::collections::HashSet;

fn normalized_set(groups: &[String]) -> HashSet<String> {
    groups
        .iter()
        .map(|g| g.trim().to_lowercase())
        .filter(|g| !g.is_empty())
        .collect()
}

/// Whether the user holds any of the required groups. Comparison is
/// lowercase-trimmed; an empty requirement trivially passes.
pub fn has_any(user_groups: &[String], required: &[String]) -> bool {
    if required.is_empty() {
        return true;
    }
    let user_set = normalized_set(user_groups);
    required
        .iter()
        .any(|r| user_set.contains(&r.trim().to_lowercase()))
}

/// Whether the user holds every required group.
pub fn has_all(user_groups: &[String], required: &[String]) -> bool {
    let user_set = normalized_set(user_groups);
    required
        .iter()
        .all(|r| user_set.contains(&r.trim().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_requirement_passes() {
        assert!(has_any(&v(&[]), &v(&[])));
        assert!(has_any(&v(&["ops"]), &v(&[])));
    }

    #[test]
    fn case_whitespace_and_order_do_not_matter() {
        let user = v(&[" BDAdmins ", "data"]);
        let required = v(&["bdadmins"]);
        assert!(has_any(&user, &required));

        // Commutative under reordering of either side.
        assert!(has_any(&v(&["data", "bdadmins"]), &v(&["BDADMINS", "x"])));
        assert!(has_any(&v(&["bdadmins", "data"]), &v(&["x", "BDADMINS"])));
    }

    #[test]
    fn disjoint_sets_fail() {
        assert!(!has_any(&v(&["dev"]), &v(&["ops", "admins"])));
    }

    #[test]
    fn has_all_requires_every_group() {
        let user = v(&["ops", "Data"]);
        assert!(has_all(&user, &v(&["OPS", "data"])));
        assert!(!has_all(&user, &v(&["ops", "admins"])));
        assert!(has_all(&user, &v(&[])));
    }
}
