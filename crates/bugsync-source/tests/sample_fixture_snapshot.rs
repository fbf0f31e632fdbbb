use bugsync_source::load_fixture_snapshot;

#[test]
fn sample_fixture_covers_every_recent_bug() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let snapshot = load_fixture_snapshot(root.join("fixtures/bugzilla/sample.json")).unwrap();
    assert_eq!(snapshot.recent.len(), 2);
    for summary in &snapshot.recent {
        let bug = snapshot
            .bugs
            .iter()
            .find(|b| b.id == summary.id)
            .expect("recent bug has details");
        assert!(!bug.target_release.is_empty());
        assert_eq!(bug.summary, summary.summary);
    }
}
