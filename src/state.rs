use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::comment::{Comment, Vote};
use crate::tree::{Engine, Entry, Input, DEFAULT_SCORE_VISIBLE_AFTER};

#[derive(Debug, Clone)]
pub struct Options {
    pub score_visible_after: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            score_visible_after: DEFAULT_SCORE_VISIBLE_AFTER,
        }
    }
}

struct Job {
    generation: u64,
    input: Input,
}

struct Shared {
    input: Mutex<Input>,
    generation: AtomicU64,
    publishing: Mutex<()>,
    updates: Sender<Vec<Entry>>,
}

impl Shared {
    // a derive result is only delivered while its snapshot is still the
    // newest one; anything else was superseded mid-flight
    fn publish(&self, generation: u64, entries: Vec<Entry>) {
        let _guard = self.publishing.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "dropping superseded derive result");
            return;
        }
        let _ = self.updates.send(entries);
    }
}

/// Serializes snapshot updates and keeps the consumer's comment list in
/// step with the newest one. Updates that change nothing are dropped
/// early; derive passes run on a worker thread unless the snapshot is
/// trivial or the caller asked for a synchronous pass, and a result is
/// only published if no newer snapshot superseded it in the meantime.
pub struct Manager {
    shared: Arc<Shared>,
    opts: Options,
    jobs: Sender<Job>,
    stop: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Manager {
    pub fn new(opts: Options, updates: Sender<Vec<Entry>>) -> Self {
        let shared = Arc::new(Shared {
            input: Mutex::new(Input::default()),
            generation: AtomicU64::new(0),
            publishing: Mutex::new(()),
            updates,
        });

        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let worker_shared = shared.clone();
        let score_visible_after = opts.score_visible_after;
        let handle =
            thread::spawn(move || worker(worker_shared, score_visible_after, job_rx, stop_rx));

        Self {
            shared,
            opts,
            jobs: job_tx,
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    /// Replaces the whole snapshot. Structurally identical input is a
    /// no-op; anything else supersedes in-flight derive passes.
    pub fn set_input(&self, next: Input) {
        self.mutate(false, move |input| *input = next);
    }

    /// Replaces the comment list. `extra` applies further snapshot
    /// changes in the same pass, typically the post author and viewer.
    /// With `sync` the derive runs on the caller thread before this
    /// returns, so the first paint never shows an empty list.
    pub fn update_comments<F>(&self, comments: Vec<Comment>, sync: bool, extra: F)
    where
        F: FnOnce(&mut Input),
    {
        self.mutate(sync, move |input| {
            input.comments = comments;
            extra(input);
        });
    }

    /// Server vote sync. Previously known base entries win, so a pending
    /// local vote keeps its score nudge until the server catches up.
    pub fn update_votes(&self, votes: HashMap<i64, Vote>) {
        self.mutate(false, move |input| {
            let mut base = votes.clone();
            base.extend(mem::take(&mut input.base_votes));
            input.base_votes = base;
            input.current_votes = votes;
        });
    }

    /// Optimistic local vote: the shown vote changes immediately while
    /// the base keeps the last server-confirmed state.
    pub fn apply_vote(&self, id: i64, vote: Vote) {
        self.mutate(false, move |input| {
            input.current_votes.insert(id, vote);
        });
    }

    pub fn collapse(&self, id: i64) {
        self.mutate(false, move |input| {
            input.collapsed.insert(id);
        });
    }

    pub fn expand(&self, id: i64) {
        self.mutate(false, move |input| {
            input.collapsed.remove(&id);
        });
    }

    pub fn select(&self, id: i64) {
        self.mutate(false, move |input| input.selected = id);
    }

    pub fn set_admin(&self, admin: bool) {
        self.mutate(false, move |input| input.admin = admin);
    }

    pub fn set_viewer(&self, viewer: Option<String>) {
        self.mutate(false, move |input| input.viewer = viewer);
    }

    pub fn input(&self) -> Input {
        self.shared.input.lock().clone()
    }

    fn mutate<F>(&self, sync: bool, apply: F)
    where
        F: FnOnce(&mut Input),
    {
        let (generation, next) = {
            let mut current = self.shared.input.lock();
            let mut next = current.clone();
            apply(&mut next);
            if *current == next {
                return;
            }
            *current = next.clone();
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (generation, next)
        };

        let run_async = !sync && !next.comments.is_empty();
        debug!(
            generation,
            comments = next.comments.len(),
            selected = next.selected,
            run_async,
            "scheduling derive pass"
        );

        if run_async {
            let _ = self.jobs.send(Job { generation, input: next });
        } else {
            let entries = Engine::new(self.opts.score_visible_after).derive(&next, Utc::now());
            self.shared.publish(generation, entries);
        }
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(
    shared: Arc<Shared>,
    score_visible_after: Duration,
    jobs: Receiver<Job>,
    stop: Receiver<()>,
) {
    let mut engine = Engine::new(score_visible_after);
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => {
                match msg {
                    Ok(mut job) => {
                        // only the newest queued snapshot matters
                        while let Ok(next) = jobs.try_recv() {
                            job = next;
                        }
                        if shared.generation.load(Ordering::SeqCst) != job.generation {
                            debug!(generation = job.generation, "skipping superseded snapshot");
                            continue;
                        }
                        let entries = engine.derive(&job.input, Utc::now());
                        shared.publish(job.generation, entries);
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::Score;
    use chrono::TimeZone;

    fn comment(id: i64, parent: i64, author: &str, confidence: f64) -> Comment {
        Comment {
            id,
            parent,
            author: author.to_string(),
            body: format!("comment {}", id),
            created: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            up: 10,
            down: 2,
            confidence,
            mark: 0,
        }
    }

    fn recv(rx: &Receiver<Vec<Entry>>) -> Vec<Entry> {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn stale_results_never_reach_the_consumer() {
        let (tx, rx) = unbounded();
        let shared = Shared {
            input: Mutex::new(Input::default()),
            generation: AtomicU64::new(2),
            publishing: Mutex::new(()),
            updates: tx,
        };

        shared.publish(1, Vec::new());
        assert!(rx.try_recv().is_err());

        shared.publish(2, Vec::new());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn synchronous_update_publishes_before_returning() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        manager.update_comments(
            vec![comment(1, 0, "op", 0.5), comment(2, 1, "x", 0.9)],
            true,
            |input| input.op = Some("op".to_string()),
        );

        let entries = rx.try_recv().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id(), 1);
    }

    #[test]
    fn unchanged_snapshot_is_a_no_op() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        let comments = vec![comment(1, 0, "a", 0.5)];
        manager.update_comments(comments.clone(), true, |_| {});
        assert!(rx.try_recv().is_ok());

        manager.update_comments(comments, true, |_| {});
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn selection_change_triggers_a_new_list() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        manager.update_comments(vec![comment(1, 0, "a", 0.5)], true, |_| {});
        let entries = recv(&rx);
        assert!(!entries[0].selected);

        manager.select(1);
        let entries = recv(&rx);
        assert!(entries[0].selected);
    }

    #[test]
    fn optimistic_vote_nudges_the_published_score() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        manager.update_comments(vec![comment(1, 0, "a", 0.5)], true, |_| {});
        let entries = recv(&rx);
        assert_eq!(entries[0].score, Score { up: 10, down: 2 });

        manager.apply_vote(1, Vote::Up);
        let entries = recv(&rx);
        assert_eq!(entries[0].vote, Vote::Up);
        assert_eq!(entries[0].score, Score { up: 11, down: 2 });
    }

    #[test]
    fn server_sync_keeps_known_base_votes() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        manager.update_comments(vec![comment(1, 0, "a", 0.5)], true, |_| {});
        let _ = recv(&rx);

        // server says the viewer already upvoted this comment
        manager.update_votes([(1, Vote::Up)].into_iter().collect());
        let entries = recv(&rx);
        assert_eq!(entries[0].score, Score { up: 10, down: 2 });

        // retract locally: base still remembers the confirmed upvote
        manager.apply_vote(1, Vote::Neutral);
        let entries = recv(&rx);
        assert_eq!(entries[0].score, Score { up: 10, down: 3 });

        // a re-sync that still reflects the old state keeps the base
        manager.update_votes([(1, Vote::Up)].into_iter().collect());
        let entries = recv(&rx);
        assert_eq!(entries[0].vote, Vote::Up);
        assert_eq!(entries[0].score, Score { up: 10, down: 2 });
    }

    #[test]
    fn collapse_and_expand_round_trip() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        manager.update_comments(
            vec![
                comment(1, 0, "a", 0.5),
                comment(2, 1, "b", 0.4),
                comment(3, 2, "c", 0.3),
            ],
            true,
            |_| {},
        );
        assert_eq!(recv(&rx).len(), 3);

        manager.collapse(1);
        let entries = recv(&rx);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hidden_count, Some(2));

        manager.expand(1);
        let entries = recv(&rx);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.hidden_count.is_none()));
    }

    #[test]
    fn last_update_wins_under_a_burst() {
        let (tx, rx) = unbounded();
        let manager = Manager::new(Options::default(), tx);

        manager.update_comments(
            (1..=20).map(|id| comment(id, 0, "a", id as f64)).collect(),
            true,
            |_| {},
        );

        for id in 1..=20 {
            manager.select(id);
        }

        let mut last = recv(&rx);
        while let Ok(entries) = rx.recv_timeout(Duration::from_millis(200)) {
            last = entries;
        }

        let selected: Vec<i64> = last
            .iter()
            .filter(|entry| entry.selected)
            .map(Entry::id)
            .collect();
        assert_eq!(selected, vec![20]);
    }
}
