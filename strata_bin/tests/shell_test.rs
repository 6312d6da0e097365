use std::path::Path;

use strata::{Database, EngineConfig};
use strata_bin::{Exit, Session};
use tempfile::tempdir;

fn session(dir: &Path) -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    Session::new(Database::open(EngineConfig::with_data_dir(dir)).unwrap())
}

fn run_script(session: &mut Session, script: &str) -> (Exit, String) {
    let mut out = Vec::new();
    let exit = session.run(script.as_bytes(), &mut out).unwrap();
    (exit, String::from_utf8(out).unwrap())
}

#[test]
fn test_script_round_trip() {
    let dir = tempdir().unwrap();
    let mut shell = session(dir.path());
    let (exit, out) = run_script(
        &mut shell,
        "create btree table accounts\n\
         transaction begin\n\
         insert accounts 1 100\n\
         insert accounts 2 200\n\
         update accounts 1 150\n\
         transaction commit\n\
         find accounts 1\n\
         select accounts\n",
    );
    assert_eq!(exit, Exit::EndOfInput);
    assert!(out.contains("updated 1 (was 100)"));
    assert!(out.contains("1: 150\n2: 200\n(2 rows)"));
    assert_eq!(shell.current_transaction(), None);
    shell.finish(exit).unwrap();
}

#[test]
fn test_mutations_need_open_transaction() {
    let dir = tempdir().unwrap();
    let mut shell = session(dir.path());
    let (_, out) = run_script(
        &mut shell,
        "create btree table t\n\
         insert t 1 1\n\
         lock t 1\n\
         abort\n\
         create hash table h\n",
    );
    assert_eq!(out.matches("error: No active transaction").count(), 3);
    assert!(out.contains("error: Unsupported"));
    assert_eq!(shell.database().find("t", 1).unwrap(), None);
}

#[test]
fn test_crash_leaves_open_transaction_to_recovery() {
    let dir = tempdir().unwrap();
    let mut shell = session(dir.path());
    let (exit, _) = run_script(
        &mut shell,
        "create btree table t\n\
         transaction begin\n\
         insert t 1 100\n\
         insert t 2 200\n\
         transaction commit\n\
         checkpoint\n\
         transaction begin\n\
         insert t 3 300\n\
         update t 1 150\n\
         crash\n\
         insert t 4 400\n",
    );
    assert_eq!(exit, Exit::Crash);
    shell.finish(exit).unwrap();

    let mut shell = session(dir.path());
    let (_, out) = run_script(&mut shell, "select t\nfind t 3\n");
    assert!(out.starts_with("1: 100\n2: 200\n(2 rows)\n"));
    assert!(out.contains("3 not found"));
}

#[test]
fn test_quit_rolls_back_open_transaction() {
    let dir = tempdir().unwrap();
    let mut shell = session(dir.path());
    let (exit, out) = run_script(
        &mut shell,
        "create btree table t\n\
         transaction begin\n\
         transaction begin\n\
         insert t 9 90\n\
         quit\n",
    );
    assert_eq!(exit, Exit::Quit);
    assert!(out.contains("is already open"));
    shell.finish(exit).unwrap();

    let shell = session(dir.path());
    assert_eq!(shell.database().find("t", 9).unwrap(), None);
}
