use temp_dir::TempDir;
use uwuboard::forum::{BUMP_LIMIT, Forum, ForumError, MAX_THREADS, PostDraft};

fn upload_dirs() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("deleted")).unwrap();
    dir
}

fn op_draft(filename: &str) -> PostDraft {
    PostDraft {
        name: String::new(),
        comment: "first post".to_string(),
        filename: Some(filename.to_string()),
    }
}

fn reply_draft(comment: &str) -> PostDraft {
    PostDraft {
        name: String::new(),
        comment: comment.to_string(),
        filename: None,
    }
}

#[test]
fn opening_post_id_equals_thread_id() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum.create_thread(op_draft("a.png"), "subject").unwrap();
    let thread = &forum.threads()[0];
    assert_eq!(thread.id, thread_id);
    assert_eq!(thread.posts[0].id, thread_id);
    assert_eq!(thread.posts[0].thread_id, thread_id);
}

#[test]
fn post_ids_strictly_increase() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum.create_thread(op_draft("a.png"), "subject").unwrap();
    let mut last = thread_id;
    for i in 0..5 {
        let id = forum
            .create_post(thread_id, reply_draft(&format!("reply {i}")))
            .unwrap();
        assert!(id > last, "{id} should be greater than {last}");
        last = id;
    }
}

#[test]
fn default_name_is_anonymous() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum.create_thread(op_draft("a.png"), "subject").unwrap();
    assert_eq!(forum.threads()[0].posts[0].name, "Anonymous");
    forum
        .create_post(
            thread_id,
            PostDraft {
                name: "fierce".to_string(),
                comment: "named reply".to_string(),
                filename: None,
            },
        )
        .unwrap();
    assert_eq!(forum.threads()[0].posts[1].name, "fierce");
}

#[test]
fn timestamp_shape() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    forum.create_thread(op_draft("a.png"), "subject").unwrap();
    let timestamp = &forum.threads()[0].posts[0].timestamp;
    assert_eq!(timestamp.len(), 19, "{timestamp:?}");
    let bytes = timestamp.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match i {
            4 | 7 => assert_eq!(b, b'-', "{timestamp:?}"),
            10 => assert_eq!(b, b' ', "{timestamp:?}"),
            13 | 16 => assert_eq!(b, b':', "{timestamp:?}"),
            _ => assert!(b.is_ascii_digit(), "{timestamp:?}"),
        }
    }
}

#[test]
fn new_threads_go_to_the_front() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let first = forum.create_thread(op_draft("a.png"), "first").unwrap();
    let second = forum.create_thread(op_draft("b.png"), "second").unwrap();
    assert_eq!(forum.threads()[0].id, second);
    assert_eq!(forum.threads()[1].id, first);
}

#[test]
fn replies_do_not_bump() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let first = forum.create_thread(op_draft("a.png"), "first").unwrap();
    let second = forum.create_thread(op_draft("b.png"), "second").unwrap();
    forum.create_post(first, reply_draft("a reply")).unwrap();
    assert_eq!(forum.threads()[0].id, second);
    assert_eq!(forum.threads()[1].id, first);
}

#[test]
fn bump_limit_sets_no_bump() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum.create_thread(op_draft("a.png"), "subject").unwrap();
    for i in 0..BUMP_LIMIT - 1 {
        forum
            .create_post(thread_id, reply_draft(&format!("reply {i}")))
            .unwrap();
    }
    // BUMP_LIMIT posts total: at the limit, not past it.
    assert_eq!(forum.threads()[0].posts.len(), BUMP_LIMIT);
    assert!(!forum.threads()[0].no_bump);
    forum.create_post(thread_id, reply_draft("one more")).unwrap();
    assert!(forum.threads()[0].no_bump);
    forum.create_post(thread_id, reply_draft("still fine")).unwrap();
    assert_eq!(forum.threads()[0].posts.len(), BUMP_LIMIT + 2);
}

#[test]
fn thread_eviction_at_capacity() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let first = forum.create_thread(op_draft("a.png"), "oldest").unwrap();
    for i in 0..MAX_THREADS {
        forum
            .create_thread(op_draft("a.png"), &format!("subject {i}"))
            .unwrap();
    }
    assert_eq!(forum.threads().len(), MAX_THREADS);
    assert!(forum.posts_by_thread(first).is_none(), "tail not evicted");
}

#[test]
fn deleting_a_thread_moves_its_uploads() {
    let dir = upload_dirs();
    std::fs::write(dir.path().join("AAAABBBBCCCCDDDDEEEE.png"), b"fake png").unwrap();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum
        .create_thread(op_draft("AAAABBBBCCCCDDDDEEEE.png"), "subject")
        .unwrap();
    forum.delete_post_or_thread(thread_id);
    assert!(forum.threads().is_empty());
    assert!(!dir.path().join("AAAABBBBCCCCDDDDEEEE.png").exists());
    assert!(dir.path().join("deleted/AAAABBBBCCCCDDDDEEEE.png").exists());
}

#[test]
fn deleting_a_placeholder_thread_leaves_files_alone() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum
        .create_thread(op_draft("placeholder.png"), "subject")
        .unwrap();
    forum.delete_post_or_thread(thread_id);
    assert!(forum.threads().is_empty());
    assert!(std::fs::read_dir(dir.path().join("deleted")).unwrap().next().is_none());
}

#[test]
fn reporting_a_reply_hides_it() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let thread_id = forum.create_thread(op_draft("a.png"), "subject").unwrap();
    let reply_id = forum.create_post(thread_id, reply_draft("rude")).unwrap();
    forum.delete_post_or_thread(reply_id);
    let posts = forum.posts_by_thread(thread_id).unwrap();
    assert_eq!(forum.threads().len(), 1);
    assert!(!posts[0].hidden);
    assert!(posts[1].hidden);
}

#[test]
fn deleting_an_unknown_id_is_a_no_op() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    forum.create_thread(op_draft("a.png"), "subject").unwrap();
    forum.delete_post_or_thread(1);
    assert_eq!(forum.threads().len(), 1);
}

#[test]
fn validation_rejects_bad_drafts() {
    let dir = upload_dirs();
    let mut forum = Forum::new(dir.path());
    let missing_comment = PostDraft {
        comment: String::new(),
        filename: Some("a.png".to_string()),
        ..PostDraft::default()
    };
    assert_eq!(
        forum.create_thread(missing_comment, "subject"),
        Err(ForumError::InvalidPost)
    );
    assert_eq!(
        forum.create_thread(
            PostDraft {
                comment: "hi".to_string(),
                filename: None,
                ..PostDraft::default()
            },
            "subject"
        ),
        Err(ForumError::InvalidPost)
    );
    assert_eq!(
        forum.create_thread(op_draft("a.png"), ""),
        Err(ForumError::InvalidPost)
    );
    assert!(forum.threads().is_empty());

    let thread_id = forum.create_thread(op_draft("a.png"), "subject").unwrap();
    let oversized = PostDraft {
        comment: "x".repeat(2048),
        ..PostDraft::default()
    };
    assert_eq!(
        forum.create_post(thread_id, oversized),
        Err(ForumError::InvalidPost)
    );
    let largest_allowed = PostDraft {
        comment: "x".repeat(2047),
        ..PostDraft::default()
    };
    assert!(forum.create_post(thread_id, largest_allowed).is_ok());
    assert_eq!(
        forum.create_post(999, reply_draft("hi")),
        Err(ForumError::ThreadNotFound)
    );
}
