//! Table-name derivation properties.

use askdb::ingest::sanitize_table_name;

#[test]
fn reference_examples() {
    assert_eq!(sanitize_table_name("Sales Report 2023.csv"), "sales_report_2023");
    assert_eq!(sanitize_table_name("123_data.csv"), "t_123_data");
}

#[test]
fn idempotent_for_all_inputs() {
    let inputs = [
        "Sales Report 2023.csv",
        "123_data.csv",
        "t_123_data",
        "already_sane",
        "weird!!name##.csv",
        "MiXeD CaSe File.CSV",
        "dots.in.the.name.csv",
        "ünïcode nämé.csv",
        ".csv",
        "-.csv",
    ];
    for input in inputs {
        let once = sanitize_table_name(input);
        let twice = sanitize_table_name(&once);
        assert_eq!(once, twice, "sanitize not idempotent for {input:?}");
    }
}

#[test]
fn leading_digit_forces_prefix() {
    assert!(sanitize_table_name("2024 report.csv").starts_with("t_"));
    assert!(sanitize_table_name("9.csv").starts_with("t_"));
}

#[test]
fn leading_letter_keeps_name() {
    assert!(!sanitize_table_name("report 2024.csv").starts_with("t_"));
}

#[test]
fn long_names_truncate_to_exactly_63() {
    let input = format!("{}.csv", "column".repeat(30));
    let name = sanitize_table_name(&input);
    assert_eq!(name.chars().count(), 63);

    // Truncation happens after the other steps, so the result is stable.
    assert_eq!(sanitize_table_name(&name).chars().count(), 63);
}

#[test]
fn special_characters_collapse_to_single_underscores() {
    assert_eq!(sanitize_table_name("a - b -- c.csv"), "a_b_c");
    assert_eq!(sanitize_table_name("sales&marketing (final).csv"), "sales_marketing_final_");
}

#[test]
fn extension_is_stripped_only_once() {
    // Interior dots belong to the stem and become underscores.
    assert_eq!(sanitize_table_name("backup.2023.csv"), "backup_2023");
}
