//! Compiling zone data to disk and serving it through a reloading database.

use std::fs;

use cdbdns::cdb::CdbFile;
use cdbdns::codec::domain_from_dot;
use cdbdns::db::Database;
use cdbdns::dns::{rcode_of, Rcode, TYPE_A, UDP_MAX_RESPONSE};
use cdbdns::lookup::lookup;
use cdbdns::zonefile::ZoneCompiler;

fn publish(dir: &std::path::Path, zone: &str) -> usize {
    let file = CdbFile::start(dir.join("data.cdb")).unwrap();
    let mut compiler = ZoneCompiler::new(file, 1);
    compiler.compile(zone.as_bytes()).unwrap();
    let failures = compiler.failures();
    compiler.into_sink().finish().unwrap();
    failures
}

fn ask(db: &Database, name: &str) -> Vec<u8> {
    let mut buf = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
    buf.extend_from_slice(&domain_from_dot(name.as_bytes()).unwrap());
    buf.extend_from_slice(&TYPE_A.to_be_bytes());
    buf.extend_from_slice(&[0, 1]);
    let len = lookup(&db.snapshot(), &mut buf, UDP_MAX_RESPONSE, "127.0.0.1".parse().unwrap());
    buf.truncate(len);
    buf
}

#[test]
fn test_published_database_is_served_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();

    // Nothing published yet.
    let db = Database::open(dir.path().join("data.cdb"));
    assert_eq!(rcode_of(&ask(&db, "www.example.com")), Some(Rcode::ServFail));

    let zone = ".example.com:ns1.example.com\n+www.example.com:192.0.2.1\n";
    assert_eq!(publish(dir.path(), zone), 0);
    assert!(!dir.path().join("data.tmp").exists());
    assert!(db.reload().unwrap());

    let answer = ask(&db, "www.example.com");
    assert_eq!(rcode_of(&answer), Some(Rcode::NoError));
    assert_eq!(&answer[answer.len() - 4..], &[192, 0, 2, 1]);

    let zone = format!("{}+new.example.com:192.0.2.2\n", zone);
    publish(dir.path(), &zone);
    assert!(db.reload().unwrap());
    assert_eq!(rcode_of(&ask(&db, "new.example.com")), Some(Rcode::NoError));
}

#[test]
fn test_discarded_build_leaves_previous_database() {
    let dir = tempfile::tempdir().unwrap();
    publish(dir.path(), ".example.com:ns1.example.com\n");
    let before = fs::read(dir.path().join("data.cdb")).unwrap();

    let file = CdbFile::start(dir.path().join("data.cdb")).unwrap();
    let mut compiler = ZoneCompiler::new(file, 2);
    compiler
        .compile(&b"+www.example.com:not-an-address\n+ok.example.com:192.0.2.9\n"[..])
        .unwrap();
    assert_eq!(compiler.failures(), 1);
    compiler.into_sink().discard().unwrap();

    assert!(!dir.path().join("data.tmp").exists());
    assert_eq!(fs::read(dir.path().join("data.cdb")).unwrap(), before);
}
