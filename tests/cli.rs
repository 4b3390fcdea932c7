use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[test]
fn help_lists_subcommands() -> Result<()> {
    cargo_run!("semsearch", "--help")
        .success()
        .stdout(predicate::str::contains("insert"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("wipe"))
        .stdout(predicate::str::contains("prepare"))
        .stdout(predicate::str::contains("evaluate"))
        .stdout(predicate::str::contains("server"));
    Ok(())
}

#[test]
fn search_requires_query() -> Result<()> {
    cargo_run!("semsearch", "search").failure().stderr(predicate::str::contains("QUERY"));
    Ok(())
}

#[test]
fn search_rejects_unknown_mode() -> Result<()> {
    cargo_run!("semsearch", "search", "a cat", "--mode", "bm25").failure();
    Ok(())
}

#[test]
fn wipe_aborts_without_confirmation() -> Result<()> {
    // 确认失败时不应访问任何外部服务，无密钥环境下也能通过
    let mut cmd = Command::cargo_bin("semsearch")?;
    cmd.args(["wipe"]).env_remove("PINECONE_API_KEY").write_stdin("no\n");
    cmd.assert().success().stdout(predicate::str::contains("已取消"));
    Ok(())
}

#[test]
fn db_wipe_requires_target() -> Result<()> {
    cargo_run!("semsearch", "db", "wipe").failure();
    Ok(())
}

#[test]
fn db_wipe_aborts_without_confirmation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("semsearch")?;
    cmd.args(["-d", dir.path().to_str().unwrap(), "db", "wipe", "--captions"])
        .write_stdin("nope\n");
    cmd.assert().success().stdout(predicate::str::contains("已取消"));
    Ok(())
}

#[test]
fn db_info_reads_local_database_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    cargo_run!("semsearch", "-d", dir.path(), "db", "info", "--id", "abc123")
        .success()
        .stdout(predicate::str::contains("abc123"));
    Ok(())
}

#[test]
fn insert_requires_path_or_dir_flag() -> Result<()> {
    // 参数冲突由 clap 校验，不触达外部服务
    cargo_run!("semsearch", "insert", "--path", "a.jpg", "--dir", "imgs").failure();
    Ok(())
}
