//! Data model shared by the policy engine, the wire codec and the store.

use std::fmt;

/// An installed application as reported by the platform's package manager.
///
/// Sourced once at startup from `packages.list` and opportunistically
/// extended when the control server reports a package quotad has not
/// seen yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub uid: u32,
}

/// gid 0 means "not yet resolved against the installed package table".
pub const UNRESOLVED_GID: u32 = 0;

/// A package under active restriction.
///
/// `gid` collapses shared-quota packages into one chain: exactly one entry
/// per active gid is the *anchor* and owns `p30_<gid>`; every other entry
/// sharing that gid is a *follower* contributing only an owner-match rule.
///
/// The anchor is *not* simply "the entry whose own uid equals gid": a
/// shared-uid application installs several packages under one platform
/// uid, and when that uid is also adopted as the group's gid every one of
/// those packages satisfies `uid == gid`. Which one owns the chain is a
/// one-time choice made when the group is formed (the first package that
/// resolves against the installed table, or — on rehydrate, where that
/// history isn't on disk — the first entry encountered for a given gid),
/// recorded explicitly in `anchor` rather than re-derived from uid/gid.
///
/// The device originally overloaded one field as both "quota assigned at
/// install time" and "bytes remaining as of the last sampler tick". This
/// splits it: `quota_kib` is the install-time budget (used to rebuild the
/// `quota2` rule on rehydrate); `remaining_kib` is the sampler's running
/// value once it has observed at least one tick, and is what gets
/// serialized and reported to the control server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEntry {
    pub package: String,
    pub uid: u32,
    pub gid: u32,
    pub quota_kib: u64,
    pub remaining_kib: Option<u64>,
    /// Whether this entry owns `p30_<gid>`. Exactly one entry per active
    /// gid should carry `true`; never derived from `uid == gid` alone
    /// (see the struct doc above).
    pub anchor: bool,
}

impl RegisteredEntry {
    pub fn is_anchor(&self) -> bool {
        self.anchor
    }

    pub fn is_resolved(&self) -> bool {
        self.gid != UNRESOLVED_GID
    }

    pub fn group_chain(&self) -> String {
        group_chain_name(self.gid)
    }

    /// The value reported on the wire: the last sampled remaining quota if
    /// the sampler has ticked at least once, else the install-time budget.
    pub fn reported_kib(&self) -> u64 {
        self.remaining_kib.unwrap_or(self.quota_kib)
    }
}

/// Name of the per-group chain owned by a group's anchor.
pub fn group_chain_name(gid: u32) -> String {
    format!("p30_{}", gid)
}

/// The shared system chain, always present once the engine has bootstrapped.
pub const SYSTEM_CHAIN: &str = "p30_1000";
pub const SYSTEM_GID: u32 = 1000;

/// The externally-installed top-level hook the engine chains onto.
pub const HOOK_CHAIN: &str = "p30dw";

/// 100 MiB expressed in the KiB units `quota2` expects.
pub const SYSTEM_QUOTA_KIB: u64 = 100 * 1024;

impl fmt::Display for RegisteredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uid={} gid={} quota={}KiB reported={}KiB",
            self.package, self.uid, self.gid, self.quota_kib, self.reported_kib()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_is_the_explicit_flag_not_uid_equals_gid() {
        let anchor = RegisteredEntry {
            package: "com.example.a".into(),
            uid: 10050,
            gid: 10050,
            quota_kib: 1024,
            remaining_kib: None,
            anchor: true,
        };
        assert!(anchor.is_anchor());

        let follower = RegisteredEntry {
            package: "com.example.b".into(),
            uid: 10051,
            gid: 10050,
            quota_kib: 1024,
            remaining_kib: None,
            anchor: false,
        };
        assert!(!follower.is_anchor());

        // Shared-uid group: a non-anchor follower can still have
        // uid == gid. The flag, not the equality, decides.
        let shared_uid_follower = RegisteredEntry {
            package: "com.g.y".into(),
            uid: 10100,
            gid: 10100,
            quota_kib: 1024,
            remaining_kib: None,
            anchor: false,
        };
        assert!(!shared_uid_follower.is_anchor());

        let unresolved = RegisteredEntry {
            package: "com.example.c".into(),
            uid: 0,
            gid: 0,
            quota_kib: 1024,
            remaining_kib: None,
            anchor: false,
        };
        assert!(!unresolved.is_anchor());
        assert!(!unresolved.is_resolved());
    }

    #[test]
    fn group_chain_naming() {
        assert_eq!(group_chain_name(10050), "p30_10050");
        assert_eq!(SYSTEM_CHAIN, "p30_1000");
    }
}
