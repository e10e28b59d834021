use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

/// Lays out `<root>/SAMSUNG/<date>/Send File/<name>` for each entry
fn create_tree(files: &[(&str, &str, &str)]) -> Result<TempDir> {
    let root = tempdir()?;
    for (date, name, content) in files {
        let dir = root.path().join("SAMSUNG").join(date).join("Send File");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), content)?;
    }
    Ok(root)
}

fn order(code: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<Batch>\n  <Order status=\"accepted\">\n    <Code>{}</Code>\n  </Order>\n</Batch>\n",
        code
    )
}

fn search(root: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("xmlscout-cli")?;
    cmd.env_remove("RUST_LOG").env("NO_COLOR", "1").args([
        "search",
        "--root",
        root.to_str().unwrap(),
        "--from",
        "2024-03-01",
        "--to",
        "2024-03-02",
    ]);
    Ok(cmd)
}

#[test]
fn test_search_reports_matching_files() -> Result<()> {
    let root = create_tree(&[
        ("20240301", "TCO_1_KMC_a.xml", &order("ERROR_CODE_42")),
        ("20240301", "TCO_2_KMC_b.xml", &order("OK")),
        ("20240302", "TCO_3_KMC_c.xml", &order("OK")),
    ])?;

    search(root.path())?
        .args(["-k", "ERROR_CODE_42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/SAMSUNG/20240301/Send File/TCO_1_KMC_a.xml"))
        .stdout(predicate::str::contains("ERROR_CODE_42"))
        .stdout(predicate::str::contains("TCO_2_KMC_b.xml").not())
        .stdout(predicate::str::contains("Found 1 matching files in 3 scanned"));

    Ok(())
}

#[test]
fn test_stats_only() -> Result<()> {
    let root = create_tree(&[
        ("20240301", "a.xml", &order("ERROR_CODE_42")),
        ("20240302", "b.xml", &order("ERROR_CODE_42")),
    ])?;

    search(root.path())?
        .args(["-k", "error_code_42", "--stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Found 2 matching files in 2 scanned"))
        .stdout(predicate::str::contains("<Code>").not());

    Ok(())
}

#[test]
fn test_json_output() -> Result<()> {
    let root = create_tree(&[
        ("20240301", "a.xml", &order("ERROR_CODE_42")),
        ("20240301", "b.xml", &order("OK")),
    ])?;

    let output = search(root.path())?
        .args(["-k", "ERROR_CODE_42", "--json", "--ordered"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(lines.len(), 3, "two records and the report");

    assert_eq!(lines[0]["candidate"]["name"], "a.xml");
    assert_eq!(lines[0]["outcome"]["status"], "matched");
    assert_eq!(lines[1]["candidate"]["name"], "b.xml");
    assert_eq!(lines[1]["outcome"]["status"], "no_match");

    let report = &lines[2];
    assert_eq!(report["status"]["status"], "completed");
    assert_eq!(report["counters"]["matched"], 1);
    assert_eq!(report["counters"]["scanned"], 2);

    Ok(())
}

#[test]
fn test_xpath_mode() -> Result<()> {
    let root = create_tree(&[
        ("20240301", "a.xml", &order("ERROR_CODE_42")),
        (
            "20240301",
            "b.xml",
            "<Batch><Order status=\"rejected\"><Code>ERROR_CODE_42</Code></Order></Batch>",
        ),
    ])?;

    search(root.path())?
        .args(["-m", "xpath", "-k", "//Order[@status='rejected']/Code"])
        .assert()
        .success()
        .stdout(predicate::str::contains("b.xml"))
        .stdout(predicate::str::contains("a.xml").not())
        .stdout(predicate::str::contains("Found 1 matching files in 2 scanned"));

    Ok(())
}

#[test]
fn test_oversized_files_are_skipped() -> Result<()> {
    let big = format!("<Batch>{}</Batch>", "<Pad/>".repeat(100));
    let root = create_tree(&[
        ("20240301", "big.xml", &big),
        ("20240301", "small.xml", &order("ERROR_CODE_42")),
    ])?;

    search(root.path())?
        .args(["-k", "ERROR_CODE_42", "--max-size", "200"])
        .assert()
        .success()
        .stdout(predicate::str::contains("big.xml: skipped"))
        .stdout(predicate::str::contains("(1 skipped, 0 errors)"));

    Ok(())
}

#[test]
fn test_glob_and_extension_filters() -> Result<()> {
    let root = create_tree(&[
        ("20240301", "TCO_1_KMC_a.xml", &order("ERROR_CODE_42")),
        ("20240301", "OTHER_b.xml", &order("ERROR_CODE_42")),
        ("20240301", "TCO_2_KMC_c.txt", &order("ERROR_CODE_42")),
    ])?;

    search(root.path())?
        .args(["-k", "ERROR_CODE_42", "--glob", "TCO_*_KMC_*"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TCO_1_KMC_a.xml"))
        .stdout(predicate::str::contains("OTHER_b.xml").not())
        .stdout(predicate::str::contains("TCO_2_KMC_c.txt").not())
        .stdout(predicate::str::contains("of 1 candidates"));

    Ok(())
}

#[test]
fn test_recursive_folder_search() -> Result<()> {
    let root = tempdir()?;
    fs::create_dir_all(root.path().join("inbox/2023"))?;
    fs::write(root.path().join("top.xml"), order("ERROR_CODE_42"))?;
    fs::write(root.path().join("inbox/2023/deep.xml"), order("ERROR_CODE_42"))?;
    fs::write(root.path().join("inbox/other.xml"), order("OK"))?;

    search(root.path())?
        .args(["-k", "ERROR_CODE_42", "--recursive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/inbox/2023/deep.xml"))
        .stdout(predicate::str::contains("/top.xml"))
        .stdout(predicate::str::contains("Found 2 matching files in 3 scanned"));

    Ok(())
}

#[test]
fn test_max_results_stops_early() -> Result<()> {
    let root = create_tree(&[
        ("20240301", "a.xml", &order("ERROR_CODE_42")),
        ("20240301", "b.xml", &order("ERROR_CODE_42")),
        ("20240301", "c.xml", &order("ERROR_CODE_42")),
    ])?;

    search(root.path())?
        .args(["-k", "ERROR_CODE_42", "-j", "1", "--max-results", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Found 1 matching files in 1 scanned"))
        .stdout(predicate::str::contains("Stopped after 1 matching files"));

    Ok(())
}

#[test]
fn test_missing_keywords_fail() -> Result<()> {
    let root = create_tree(&[("20240301", "a.xml", &order("OK"))])?;

    search(root.path())?
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one keyword is required"));

    Ok(())
}

#[test]
fn test_reversed_date_range_fails() -> Result<()> {
    let root = create_tree(&[("20240301", "a.xml", &order("OK"))])?;

    let mut cmd = Command::cargo_bin("xmlscout-cli")?;
    cmd.args([
        "search",
        "--root",
        root.path().to_str().unwrap(),
        "--from",
        "2024-03-05",
        "--to",
        "2024-03-01",
        "-k",
        "OK",
    ])
    .assert()
    .failure();

    Ok(())
}

#[test]
fn test_missing_root_fails_the_run() -> Result<()> {
    let root = tempdir()?;
    let missing = root.path().join("not-there");
    let config = root.path().join("config.yaml");
    fs::write(&config, "pool:\n  max_retries: 0\n")?;

    search(&missing)?
        .args(["-k", "ERROR_CODE_42", "--config", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("search failed"));

    Ok(())
}

#[test]
fn test_config_command_prints_effective_config() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("config.yaml");
    fs::write(&path, "layout:\n  send_directory: \"Outbox\"\npool:\n  size: 3\n")?;

    Command::cargo_bin("xmlscout-cli")?
        .args(["config", "--config", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("send_directory: Outbox"))
        .stdout(predicate::str::contains("size: 3"))
        .stdout(predicate::str::contains("password").not());

    Ok(())
}
