use predicates::prelude::*;

const DB_ENV: &str = "AUD_DATABASE_URL";

fn cli(dir: &tempfile::TempDir, db_url: &str) -> anyhow::Result<assert_cmd::Command> {
    let mut cmd = assert_cmd::Command::cargo_bin("aud-cli")?;
    cmd.current_dir(dir.path()).env(DB_ENV, db_url);
    Ok(cmd)
}

/// File-backed DB in a temp dir: migrate, schedule, list, reject duplicate.
#[test]
fn schedule_then_list_pending() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db_url = format!("sqlite://{}", dir.path().join("aud.db").display());

    cli(&dir, &db_url)?
        .args(["db", "migrate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("migrations_applied=true"));

    let schedule_args = [
        "schedule",
        "--owner",
        "com.example.app",
        "--uri",
        "https://buyer.example/update",
        "--delay-minutes",
        "45",
        "--overrides",
        r#"[{"name":"x","user_bidding_signals":{"k":1}}]"#,
        "--leave",
        "old",
    ];

    cli(&dir, &db_url)?
        .args(schedule_args)
        .assert()
        .success()
        .stdout(predicate::str::contains("scheduled=true"));

    cli(&dir, &db_url)?
        .args(schedule_args)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already pending"));

    cli(&dir, &db_url)?
        .args(["pending", "--owner", "com.example.app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("buyer=buyer.example"))
        .stdout(predicate::str::contains("overrides=1 leaves=1"))
        .stdout(predicate::str::contains("pending=1"));

    cli(&dir, &db_url)?
        .args(["db", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("has_schema=true pending_updates=1"));

    // Not due for 45 minutes, so nothing is fetched.
    cli(&dir, &db_url)?
        .args(["run-once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("found=0"));

    Ok(())
}

#[test]
fn delay_outside_bounds_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db_url = format!("sqlite://{}", dir.path().join("aud.db").display());

    cli(&dir, &db_url)?.args(["db", "migrate"]).assert().success();

    cli(&dir, &db_url)?
        .args([
            "schedule",
            "--owner",
            "com.example.app",
            "--uri",
            "https://buyer.example/update",
            "--delay-minutes",
            "5",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid schedule request"));

    Ok(())
}

#[test]
fn config_hash_is_printed_and_strict_mode_rejects_unknown_keys() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("base.yaml");
    std::fs::write(&base, "quota:\n  max_total: 10\n")?;
    let typo = dir.path().join("typo.yaml");
    std::fs::write(&typo, "quota:\n  max_totl: 10\n")?;

    let mut ok = assert_cmd::Command::cargo_bin("aud-cli")?;
    ok.current_dir(dir.path())
        .arg("config-hash")
        .arg(&base)
        .assert()
        .success()
        .stdout(predicate::str::contains("config_hash="))
        .stdout(predicate::str::contains(r#"{"quota":{"max_total":10}}"#));

    let mut strict = assert_cmd::Command::cargo_bin("aud-cli")?;
    strict
        .current_dir(dir.path())
        .args(["config-hash", "--strict"])
        .arg(&base)
        .arg(&typo)
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_UNUSED_KEYS"));

    Ok(())
}
