use crate::config::PLACEHOLDER_IMAGE;
use chrono::Local;
use log::warn;
use std::path::{Path, PathBuf};

pub const POST_NAME_MAX: usize = 64;
pub const POST_FILENAME_MAX: usize = 64;
pub const POST_COMMENT_MAX: usize = 2048;
pub const THREAD_SUBJECT_MAX: usize = 64;
pub const MAX_THREADS: usize = 1000;
pub const BUMP_LIMIT: usize = 200;

const FIRST_POST_ID: u64 = 2137;
const DEFAULT_NAME: &str = "Anonymous";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForumError {
    InvalidPost,
    ThreadNotFound,
}

/// Caller-supplied fields of a post in the making. Text must already be
/// sanitized; the model only enforces presence and length.
#[derive(Clone, Debug, Default)]
pub struct PostDraft {
    pub name: String,
    pub comment: String,
    pub filename: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Post {
    pub id: u64,
    pub thread_id: u64,
    pub name: String,
    pub timestamp: String,
    pub filename: Option<String>,
    pub comment: String,
    pub hidden: bool,
}

#[derive(Clone, Debug)]
pub struct Thread {
    pub id: u64,
    pub subject: String,
    pub posts: Vec<Post>,
    pub no_bump: bool,
}

/// The in-memory forum: an ordered list of threads, newest first. Owns all
/// threads and their posts exclusively, plus the uploads directory that
/// post filenames refer to.
pub struct Forum {
    threads: Vec<Thread>,
    next_post_id: u64,
    uploads_dir: PathBuf,
}
impl Forum {
    pub fn new(uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            threads: Vec::new(),
            next_post_id: FIRST_POST_ID,
            uploads_dir: uploads_dir.into(),
        }
    }

    #[must_use]
    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    #[must_use]
    pub fn posts_by_thread(&self, thread_id: u64) -> Option<&[Post]> {
        self.threads
            .iter()
            .find(|t| t.id == thread_id)
            .map(|t| t.posts.as_slice())
    }

    /// Creates a new thread from an opening-post draft. The thread takes
    /// index 0; its id equals the opening post's id. Past [`MAX_THREADS`]
    /// the tail thread is deleted, uploads and all.
    ///
    /// # Errors
    /// Returns [`ForumError::InvalidPost`] when the comment is missing or
    /// over-long, or the filename or subject is missing.
    pub fn create_thread(&mut self, draft: PostDraft, subject: &str) -> Result<u64, ForumError> {
        validate_post(&draft, Some(subject))?;
        let id = self.next_id();
        self.threads.insert(
            0,
            Thread {
                id,
                subject: subject.to_string(),
                posts: Vec::new(),
                no_bump: false,
            },
        );
        self.append_post(0, id, draft);
        if self.threads.len() > MAX_THREADS {
            self.delete_thread_at(self.threads.len() - 1);
        }
        Ok(id)
    }

    /// Appends a reply to an existing thread and returns its fresh id.
    ///
    /// # Errors
    /// Returns an error when the thread does not exist or the draft fails
    /// validation.
    pub fn create_post(&mut self, thread_id: u64, draft: PostDraft) -> Result<u64, ForumError> {
        let pos = self
            .threads
            .iter()
            .position(|t| t.id == thread_id)
            .ok_or_else(|| {
                warn!("create_post: thread {thread_id} not found");
                ForumError::ThreadNotFound
            })?;
        let is_op = self.threads[pos].posts.is_empty();
        // Opening posts were already validated in create_thread, together
        // with the subject.
        if !is_op {
            validate_post(&draft, None)?;
        }
        let id = if is_op { thread_id } else { self.next_id() };
        self.append_post(pos, id, draft);
        Ok(id)
    }

    /// Reporting a thread id deletes the whole thread; reporting a reply
    /// hides it. An unknown id is a no-op.
    pub fn delete_post_or_thread(&mut self, post_id: u64) {
        if let Some(pos) = self.threads.iter().position(|t| t.id == post_id) {
            self.delete_thread_at(pos);
            return;
        }
        match self
            .threads
            .iter_mut()
            .flat_map(|t| t.posts.iter_mut())
            .find(|p| p.id == post_id)
        {
            Some(post) => post.hidden = true,
            None => warn!("delete_post_or_thread: post {post_id} not found"),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_post_id;
        self.next_post_id += 1;
        id
    }

    fn append_post(&mut self, pos: usize, id: u64, draft: PostDraft) {
        let thread = &mut self.threads[pos];
        let name = if draft.name.is_empty() {
            DEFAULT_NAME.to_string()
        } else {
            draft.name
        };
        thread.posts.push(Post {
            id,
            thread_id: thread.id,
            name,
            timestamp: timestamp_string(),
            filename: draft.filename,
            comment: draft.comment,
            hidden: false,
        });
        if thread.posts.len() > BUMP_LIMIT {
            thread.no_bump = true;
        }
        // TODO: decide whether a reply should move its thread to index 0
        // while no_bump is unset.
    }

    fn delete_thread_at(&mut self, pos: usize) {
        let thread = self.threads.remove(pos);
        for post in &thread.posts {
            self.retire_upload(post);
        }
    }

    /// Moves a deleted post's upload out of the public directory. The
    /// placeholder image is shared by sample data and stays put.
    fn retire_upload(&self, post: &Post) {
        let Some(filename) = &post.filename else {
            return;
        };
        if filename.is_empty() || filename == PLACEHOLDER_IMAGE {
            return;
        }
        let old = self.uploads_dir.join(filename);
        let new = self.uploads_dir.join("deleted").join(filename);
        if let Err(e) = std::fs::rename(&old, &new) {
            warn!("failed to move {} to {}: {e}", old.display(), new.display());
        }
    }
}

fn timestamp_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn validate_post(draft: &PostDraft, op_subject: Option<&str>) -> Result<(), ForumError> {
    if draft.comment.is_empty() {
        warn!("validate_post: missing comment");
        return Err(ForumError::InvalidPost);
    }
    if let Some(subject) = op_subject {
        if draft.filename.as_deref().unwrap_or("").is_empty() {
            warn!("validate_post: missing filename");
            return Err(ForumError::InvalidPost);
        }
        if subject.is_empty() {
            warn!("validate_post: missing subject");
            return Err(ForumError::InvalidPost);
        }
    }
    if draft.comment.len() + 1 > POST_COMMENT_MAX {
        warn!("validate_post: comment too large");
        return Err(ForumError::InvalidPost);
    }
    Ok(())
}

const SAMPLE_COMMENTS: &[&str] = &[
    "Lorem ipsum dolor sit amet, consectetur adipiscing elit.<br><br>Praesent interdum vitae ante non accumsan.",
    "Phasellus aliquam molestie maximus. Mauris porttitor aliquam velit a tristique.",
    "Fusce eleifend luctus elit.<br>Donec massa lectus, porta sed pellentesque vel, dignissim sed dui.",
    "Sed eget arcu nunc.<br>Nam sed rhoncus velit, in hendrerit nulla.",
];

/// Populates a freshly created forum with a few canned threads so the demo
/// binary has something to render.
pub fn seed_demo(forum: &mut Forum) {
    for (i, subject) in ["Green Is My Pepper", "Poll loops", "Pics thread"]
        .iter()
        .enumerate()
    {
        let op = PostDraft {
            comment: SAMPLE_COMMENTS[i % SAMPLE_COMMENTS.len()].to_string(),
            filename: Some(PLACEHOLDER_IMAGE.to_string()),
            ..PostDraft::default()
        };
        let Ok(thread_id) = forum.create_thread(op, subject) else {
            warn!("seed_demo: failed to create sample thread");
            continue;
        };
        for j in 0..3 {
            let reply = PostDraft {
                comment: SAMPLE_COMMENTS[(i + j + 1) % SAMPLE_COMMENTS.len()].to_string(),
                filename: (j % 2 == 0).then(|| PLACEHOLDER_IMAGE.to_string()),
                ..PostDraft::default()
            };
            if forum.create_post(thread_id, reply).is_err() {
                warn!("seed_demo: failed to create sample post");
            }
        }
    }
}
