//! Leader election among the account's connected instances.
//!
//! Every instance sees the same presence set and therefore elects the same
//! leader without talking to the others: the lexically smallest instance id
//! wins.

/// Missed heartbeat cycles after which a follower takes over.
pub const DEFAULT_PROMOTION_THRESHOLD: u32 = 3;

/// Pick the leader from a set of instance ids. `None` for an empty set.
pub fn elect_leader<'a, I>(ids: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    ids.into_iter().min()
}

/// Whether a follower that has missed `missed_cycles` heartbeats promotes.
pub fn should_promote(missed_cycles: u32, threshold: u32) -> bool {
    missed_cycles >= threshold
}

/// This instance's role as seen locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// No presence data yet.
    #[default]
    Unknown,
    Leader,
    Follower,
    /// A follower that took over after the elected leader went quiet.
    Promoted,
}

/// Follower-side heartbeat bookkeeping.
///
/// Call [`observe_presence`](Self::observe_presence) whenever the presence set
/// changes, [`heartbeat`](Self::heartbeat) when the leader proves it is alive,
/// and [`cycle`](Self::cycle) once per heartbeat interval.
#[derive(Debug, Clone)]
pub struct FollowerWatch {
    me: String,
    threshold: u32,
    leader: Option<String>,
    missed: u32,
    heard_this_cycle: bool,
    promoted: bool,
}

impl FollowerWatch {
    pub fn new(me: impl Into<String>, threshold: u32) -> Self {
        Self {
            me: me.into(),
            threshold,
            leader: None,
            missed: 0,
            heard_this_cycle: false,
            promoted: false,
        }
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn missed_cycles(&self) -> u32 {
        self.missed
    }

    pub fn role(&self) -> Role {
        match self.leader.as_deref() {
            None => Role::Unknown,
            Some(leader) if leader == self.me => Role::Leader,
            Some(_) if self.promoted => Role::Promoted,
            Some(_) => Role::Follower,
        }
    }

    /// Re-run the election. A change of leader restarts the miss count.
    pub fn observe_presence<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let elected = elect_leader(ids).map(str::to_owned);
        if elected != self.leader {
            self.leader = elected;
            self.missed = 0;
            self.heard_this_cycle = false;
            self.promoted = false;
        }
    }

    /// A heartbeat from `instance_id`. Only the elected leader counts.
    pub fn heartbeat(&mut self, instance_id: &str) {
        if self.leader.as_deref() == Some(instance_id) {
            self.heard_this_cycle = true;
            self.missed = 0;
            self.promoted = false;
        }
    }

    /// Close one heartbeat cycle and return the resulting role.
    pub fn cycle(&mut self) -> Role {
        if matches!(self.role(), Role::Follower | Role::Promoted) {
            if self.heard_this_cycle {
                self.missed = 0;
            } else {
                self.missed = self.missed.saturating_add(1);
            }
            if should_promote(self.missed, self.threshold) {
                self.promoted = true;
            }
        }
        self.heard_this_cycle = false;
        self.role()
    }

    pub fn reset(&mut self) {
        self.leader = None;
        self.missed = 0;
        self.heard_this_cycle = false;
        self.promoted = false;
    }
}
