use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::comment::{Comment, Score, Vote};

/// Comments older than this have their points shown to everyone.
pub const DEFAULT_SCORE_VISIBLE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Everything needed to derive the visible comment list for one post.
/// A pure value object: user actions produce modified copies, and a new
/// snapshot only triggers a derive pass if it compares unequal to the
/// previous one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Input {
    pub comments: Vec<Comment>,
    /// Votes as currently shown, including local actions the server has
    /// not confirmed yet. Absent id means `Neutral`.
    pub current_votes: HashMap<i64, Vote>,
    /// Votes as last known from the server, used to detect pending
    /// local changes. Absent id means `Neutral`.
    pub base_votes: HashMap<i64, Vote>,
    pub collapsed: HashSet<i64>,
    /// Author of the post the comments belong to.
    pub op: Option<String>,
    /// Signed-in user, if any.
    pub viewer: Option<String>,
    pub admin: bool,
    pub selected: i64,
}

/// One row of the rendered comment list.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub comment: Comment,
    pub vote: Vote,
    pub depth: usize,
    /// Bit i set means a vertical guide line is drawn at indent level i
    /// for this row.
    pub spacings: u64,
    pub has_children: bool,
    pub score: Score,
    pub op_author: bool,
    /// `Some(n)` when this comment is collapsed, hiding n descendants.
    pub hidden_count: Option<usize>,
    pub points_visible: bool,
    pub selected: bool,
}

impl Entry {
    pub fn id(&self) -> i64 {
        self.comment.id
    }

    pub fn is_collapsed(&self) -> bool {
        self.hidden_count.is_some()
    }

    pub fn can_collapse(&self) -> bool {
        self.has_children && self.hidden_count.is_none()
    }
}

/// Flattens a snapshot of hierarchical comments into the ordered,
/// depth-annotated list of rows that are actually visible.
///
/// Derivation is total: dangling parents degrade to root placement and
/// malformed collapse or vote entries are ignored, never an error.
pub struct Engine {
    score_visible_after: chrono::Duration,
    depth_cache: HashMap<i64, usize>,
    known_parents: HashMap<i64, i64>,
}

impl Engine {
    pub fn new(score_visible_after: Duration) -> Self {
        Self {
            score_visible_after: chrono::Duration::from_std(score_visible_after)
                .unwrap_or(chrono::Duration::MAX),
            depth_cache: HashMap::new(),
            known_parents: HashMap::new(),
        }
    }

    pub fn derive(&mut self, input: &Input, now: DateTime<Utc>) -> Vec<Entry> {
        let by_id: HashMap<i64, &Comment> = input
            .comments
            .iter()
            .filter(|comment| comment.id != 0)
            .map(|comment| (comment.id, comment))
            .collect();

        // group children per parent, keeping snapshot order; a parent id
        // missing from the snapshot degrades to root placement
        let mut by_parent: HashMap<i64, Vec<&Comment>> = HashMap::new();
        for comment in input.comments.iter().filter(|comment| comment.id != 0) {
            let parent = if comment.parent == 0 || by_id.contains_key(&comment.parent) {
                comment.parent
            } else {
                0
            };
            by_parent.entry(parent).or_default().push(comment);
        }

        // op comments first, then ascending confidence; ties keep their
        // snapshot order
        for children in by_parent.values_mut() {
            children.sort_by(|a, b| {
                let a_op = is_op(input, a);
                let b_op = is_op(input, b);
                b_op.cmp(&a_op)
                    .then(a.confidence.total_cmp(&b.confidence))
            });
        }

        self.refresh_depth_cache(&by_id);

        let linear = linearize(&by_parent, &input.collapsed);

        let mut depths = vec![0usize; linear.len()];
        let mut spacings = vec![0u64; linear.len()];
        for idx in 0..linear.len() {
            let depth = self.depth_of(linear[idx], &by_id);
            depths[idx] = depth;

            let bit = 1u64.checked_shl(depth as u32).unwrap_or(0);
            spacings[idx] |= bit;

            // extend the guide line up through every deeper predecessor,
            // stopping at the first row at this depth or above
            for back in (0..idx).rev() {
                if depths[back] <= depth {
                    break;
                }
                spacings[back] |= bit;
            }
        }

        linear
            .iter()
            .enumerate()
            .map(|(idx, &comment)| {
                let vote = input
                    .current_votes
                    .get(&comment.id)
                    .copied()
                    .unwrap_or_default();
                let collapsed = input.collapsed.contains(&comment.id);

                Entry {
                    comment: comment.clone(),
                    vote,
                    depth: depths[idx],
                    spacings: spacings[idx],
                    has_children: by_parent.contains_key(&comment.id),
                    score: display_score(input, comment, vote),
                    op_author: is_op(input, comment),
                    hidden_count: collapsed.then(|| count_subtree(&by_parent, comment)),
                    points_visible: self.points_visible(input, comment, now),
                    selected: input.selected == comment.id,
                }
            })
            .collect()
    }

    fn points_visible(&self, input: &Input, comment: &Comment, now: DateTime<Utc>) -> bool {
        if input.admin {
            return true;
        }
        if input.viewer.as_deref() == Some(comment.author.as_str()) {
            return true;
        }
        now.signed_duration_since(comment.created) >= self.score_visible_after
    }

    // depths only depend on id/parent links, so cached values stay valid
    // until a known comment vanishes or moves to a different parent
    fn refresh_depth_cache(&mut self, by_id: &HashMap<i64, &Comment>) {
        let changed = self
            .known_parents
            .iter()
            .any(|(id, parent)| by_id.get(id).map(|comment| comment.parent) != Some(*parent));
        if changed {
            self.depth_cache.clear();
        }
        self.known_parents = by_id
            .values()
            .map(|comment| (comment.id, comment.parent))
            .collect();
    }

    fn depth_of(&mut self, comment: &Comment, by_id: &HashMap<i64, &Comment>) -> usize {
        if let Some(depth) = self.depth_cache.get(&comment.id) {
            return *depth;
        }

        // walk up until a cached ancestor or a root, then memoize every
        // depth discovered along the chain
        let mut chain = vec![comment.id];
        let mut current = comment;
        let mut base = 0;
        loop {
            if current.parent == 0 {
                break;
            }
            if let Some(depth) = self.depth_cache.get(&current.parent) {
                base = depth + 1;
                break;
            }
            match by_id.get(&current.parent).copied() {
                Some(parent) => {
                    chain.push(parent.id);
                    current = parent;
                }
                // absent parent, the chain ends at a synthetic root
                None => break,
            }
        }

        for (hops, id) in chain.iter().rev().enumerate() {
            self.depth_cache.insert(*id, base + hops);
        }
        base + chain.len() - 1
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DEFAULT_SCORE_VISIBLE_AFTER)
    }
}

// pre-order walk with an explicit stack; children of collapsed comments
// are never pushed, the collapsed comment itself still shows up. pushing
// in reverse restores the sorted sibling order when popping.
fn linearize<'a>(
    by_parent: &HashMap<i64, Vec<&'a Comment>>,
    collapsed: &HashSet<i64>,
) -> Vec<&'a Comment> {
    let mut out = Vec::new();
    let mut stack: Vec<&Comment> = Vec::new();

    if let Some(roots) = by_parent.get(&0) {
        stack.extend(roots.iter().rev().copied());
    }

    while let Some(comment) = stack.pop() {
        out.push(comment);
        if !collapsed.contains(&comment.id) {
            if let Some(children) = by_parent.get(&comment.id) {
                stack.extend(children.iter().rev().copied());
            }
        }
    }

    out
}

fn is_op(input: &Input, comment: &Comment) -> bool {
    input.op.as_deref() == Some(comment.author.as_str())
}

// nudge the tally by at most one unit toward a pending local vote
fn display_score(input: &Input, comment: &Comment, vote: Vote) -> Score {
    let base = input
        .base_votes
        .get(&comment.id)
        .copied()
        .unwrap_or_default();
    let delta = (vote.value() - base.value()).signum();

    Score {
        up: comment.up + delta.max(0),
        down: comment.down + (-delta).max(0),
    }
}

fn count_subtree(by_parent: &HashMap<i64, Vec<&Comment>>, start: &Comment) -> usize {
    let mut count = 0;
    let mut stack = vec![start];
    while let Some(comment) = stack.pop() {
        if let Some(children) = by_parent.get(&comment.id) {
            count += children.len();
            stack.extend(children.iter().copied());
        }
    }
    count
}
