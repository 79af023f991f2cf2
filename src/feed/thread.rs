// SPDX-License-Identifier: MPL-2.0

use crate::model::{Comment, CommentId, Post, PostId, UserProfile};

/// A single post with its comments, newest first.
#[derive(Debug, Clone)]
pub struct PostThread {
    post_id: PostId,
    post: Option<Post>,
    comments: Vec<Comment>,
}

impl PostThread {
    pub fn new(post_id: PostId) -> Self {
        Self {
            post_id,
            post: None,
            comments: Vec::new(),
        }
    }

    pub fn post_id(&self) -> PostId {
        self.post_id
    }

    pub fn post(&self) -> Option<&Post> {
        self.post.as_ref()
    }

    pub(crate) fn post_mut(&mut self) -> Option<&mut Post> {
        self.post.as_mut()
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// Install a fetched post and its comments. The comments may arrive in
    /// any order; they are held newest first.
    pub fn load(&mut self, post: Option<Post>, mut comments: Vec<Comment>) {
        comments.retain(|c| c.post_id == self.post_id);
        comments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        comments.dedup_by_key(|c| c.id);
        self.post = post;
        self.comments = comments;
    }

    /// Put a live comment at the head. Returns false when the id was
    /// already held (its text is refreshed in place) or the comment
    /// belongs to another post.
    pub fn insert_comment(&mut self, comment: Comment) -> bool {
        if comment.post_id != self.post_id {
            return false;
        }
        if let Some(existing) = self.comments.iter_mut().find(|c| c.id == comment.id) {
            existing.text = comment.text;
            return false;
        }
        self.comments.insert(0, comment);
        true
    }

    pub fn remove_comment(&mut self, id: CommentId) -> Option<Comment> {
        let index = self.comments.iter().position(|c| c.id == id)?;
        Some(self.comments.remove(index))
    }

    pub fn patch_author(&mut self, id: CommentId, author: UserProfile) {
        if let Some(comment) = self.comments.iter_mut().find(|c| c.id == id) {
            comment.author = Some(author);
        }
    }
}
