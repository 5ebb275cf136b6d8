use warden_integration::TestHub;
use warden_protocol::messages::{FileChange, ListTreeRequest};

#[tokio::test]
async fn agent_reports_file_tree_changes() {
    let hub = TestHub::start().await;
    let state = tempfile::tempdir().unwrap();
    let watched = tempfile::tempdir().unwrap();
    std::fs::create_dir(watched.path().join("docs")).unwrap();
    std::fs::write(watched.path().join("docs").join("plan.md"), "# plan").unwrap();

    let agent = hub.agent("dev-tree", state.path(), vec![watched.path().to_path_buf()]);
    let run = agent.clone();
    let task = tokio::spawn(async move { run.run().await });

    let plan = hub.wait_for_node("dev-tree", "plan.md").await;
    assert_eq!(plan.total_size, 6);
    assert_eq!(plan.cur_ext, "md");
    assert!(!plan.is_dir);

    // Files created later show up on a following tick.
    std::fs::write(watched.path().join("notes.txt"), "later").unwrap();
    let notes = hub.wait_for_node("dev-tree", "notes.txt").await;
    assert!(notes.snapshot_number > plan.snapshot_number);

    let mut admin = hub.client().await;
    let req = ListTreeRequest {
        device_id: "dev-tree".into(),
    };
    let nodes: Vec<FileChange> = admin.request_json("admin_list_tree", Some(&req)).await;
    let names: Vec<&str> = nodes.iter().map(|n| n.cur_name.as_str()).collect();
    assert!(names.contains(&"plan.md"));
    assert!(names.contains(&"notes.txt"));
    assert!(names.contains(&"docs"));

    agent.shutdown().await;
    task.await.unwrap().unwrap();
}
