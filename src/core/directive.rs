//! Typed packet-filter directives and their rendering
//!
//! A [`Directive`] is one iptables/ip6tables operation. Directives are built by
//! the policy compiler, never mutated afterwards, and rendered to argv by a
//! single function, [`Directive::to_args`]. Nothing in this module spawns a
//! process, so compiled output can be inspected and tested directly.
//!
//! A [`RuleSet`] is an ordered sequence of directives. Order is part of its
//! correctness contract: the lock-release directive of each bootstrap chain
//! must run after every allow rule for that chain, chains must be flushed
//! before they are deleted, and so on. A `RuleSet` is only ever appended to.
//!
//! # Example
//!
//! ```
//! use proxywall::core::capability::FeatureFlags;
//! use proxywall::core::directive::{Directive, MatchSpec, Table};
//!
//! let d = Directive::append(
//!     Table::Nat,
//!     "ow_OUTPUT",
//!     MatchSpec::new().dest("127.0.0.1/32").jump("RETURN"),
//! );
//! let args = d.to_args(&FeatureFlags::default());
//! assert_eq!(args, ["-t", "nat", "-A", "ow_OUTPUT", "-d", "127.0.0.1/32", "-j", "RETURN"]);
//! ```

use crate::core::capability::FeatureFlags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Which filter engine a directive targets
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Family {
    /// iptables
    #[default]
    #[strum(serialize = "ipv4")]
    Ipv4,
    /// ip6tables
    #[strum(serialize = "ipv6")]
    Ipv6,
}

/// Packet-filter table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Table {
    /// Allow/deny decisions
    #[strum(serialize = "filter")]
    Filter,
    /// Address/port redirection
    #[strum(serialize = "nat")]
    Nat,
}

/// The operation a directive performs on its chain
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Action {
    #[strum(serialize = "policy")]
    Policy,
    #[strum(serialize = "new-chain")]
    NewChain,
    #[strum(serialize = "delete-chain")]
    DeleteChain,
    #[strum(serialize = "flush")]
    Flush,
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "insert")]
    Insert,
    #[strum(serialize = "delete")]
    Delete,
    #[strum(serialize = "check")]
    Check,
}

impl Action {
    /// Returns the iptables command flag
    pub const fn flag(self) -> &'static str {
        match self {
            Action::Policy => "-P",
            Action::NewChain => "-N",
            Action::DeleteChain => "-X",
            Action::Flush => "-F",
            Action::Append => "-A",
            Action::Insert => "-I",
            Action::Delete => "-D",
            Action::Check => "-C",
        }
    }

    /// Returns the action that undoes this one, if there is a single-directive inverse.
    ///
    /// Both `Append` and `Insert` are undone by `Delete`. `Delete` maps back to
    /// `Append`; callers that inserted pick `Insert` themselves.
    pub const fn inverse(self) -> Option<Action> {
        match self {
            Action::Append | Action::Insert => Some(Action::Delete),
            Action::Delete => Some(Action::Append),
            Action::NewChain => Some(Action::DeleteChain),
            Action::DeleteChain => Some(Action::NewChain),
            Action::Policy | Action::Flush | Action::Check => None,
        }
    }

    /// Removal actions fail harmlessly when their target is already gone
    pub const fn is_removal(self) -> bool {
        matches!(self, Action::Delete | Action::Flush | Action::DeleteChain)
    }
}

/// Rule match specification and target, as an argv token list.
///
/// Built with chained helpers so that every token is a separate argument and
/// nothing is ever interpreted by a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchSpec(Vec<String>);

impl MatchSpec {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    fn push(mut self, tokens: &[&str]) -> Self {
        self.0.extend(tokens.iter().map(|t| (*t).to_string()));
        self
    }

    /// Appends a single raw token (policy targets, chain positions)
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.0.push(token.into());
        self
    }

    /// `-p <proto>`
    pub fn proto(self, proto: &str) -> Self {
        self.push(&["-p", proto])
    }

    /// `-m <module>`
    pub fn module(self, module: &str) -> Self {
        self.push(&["-m", module])
    }

    /// `-m owner --uid-owner <uid>`
    pub fn uid_owner(self, uid: u32) -> Self {
        self.push(&["-m", "owner", "--uid-owner"]).token(uid.to_string())
    }

    /// `-m owner --gid-owner <group>`
    pub fn gid_owner(self, group: &str) -> Self {
        self.push(&["-m", "owner", "--gid-owner", group])
    }

    /// `-m conntrack --ctstate <states>`
    pub fn ctstate(self, states: &str) -> Self {
        self.push(&["-m", "conntrack", "--ctstate", states])
    }

    /// `--dport <port>`
    pub fn dport(self, port: u16) -> Self {
        self.token("--dport").token(port.to_string())
    }

    /// `--sport <port>`
    pub fn sport(self, port: u16) -> Self {
        self.token("--sport").token(port.to_string())
    }

    /// `--tcp-flags <mask> <comp>`
    pub fn tcp_flags(self, mask: &str, comp: &str) -> Self {
        self.push(&["--tcp-flags", mask, comp])
    }

    /// `-d <addr>`
    pub fn dest(self, addr: impl fmt::Display) -> Self {
        self.token("-d").token(addr.to_string())
    }

    /// `-s <addr>`
    pub fn source(self, addr: impl fmt::Display) -> Self {
        self.token("-s").token(addr.to_string())
    }

    /// `-i <iface>`
    pub fn in_iface(self, iface: &str) -> Self {
        self.push(&["-i", iface])
    }

    /// `-o <iface>`
    pub fn out_iface(self, iface: &str) -> Self {
        self.push(&["-o", iface])
    }

    /// `-j <target>`
    pub fn jump(self, target: &str) -> Self {
        self.push(&["-j", target])
    }

    /// `-j REDIRECT --to-ports <port>`
    pub fn redirect_to(self, port: u16) -> Self {
        self.push(&["-j", "REDIRECT", "--to-ports"])
            .token(port.to_string())
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// One packet-filter operation.
///
/// Equality and hashing are structural over family, table, chain, action and
/// match spec. The annotation is presentation only and does not make two
/// otherwise identical operations different.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    family: Family,
    table: Table,
    chain: String,
    action: Action,
    spec: MatchSpec,
    annotation: Option<String>,
}

impl Directive {
    pub fn new(table: Table, action: Action, chain: impl Into<String>, spec: MatchSpec) -> Self {
        Self {
            family: Family::Ipv4,
            table,
            chain: chain.into(),
            action,
            spec,
            annotation: None,
        }
    }

    /// `-P <chain> <target>` on the filter table
    pub fn policy(chain: impl Into<String>, target: &str) -> Self {
        Self::new(Table::Filter, Action::Policy, chain, MatchSpec::new().token(target))
    }

    pub fn new_chain(table: Table, chain: impl Into<String>) -> Self {
        Self::new(table, Action::NewChain, chain, MatchSpec::new())
    }

    pub fn delete_chain(table: Table, chain: impl Into<String>) -> Self {
        Self::new(table, Action::DeleteChain, chain, MatchSpec::new())
    }

    pub fn flush(table: Table, chain: impl Into<String>) -> Self {
        Self::new(table, Action::Flush, chain, MatchSpec::new())
    }

    pub fn append(table: Table, chain: impl Into<String>, spec: MatchSpec) -> Self {
        Self::new(table, Action::Append, chain, spec)
    }

    pub fn insert(table: Table, chain: impl Into<String>, spec: MatchSpec) -> Self {
        Self::new(table, Action::Insert, chain, spec)
    }

    pub fn delete(table: Table, chain: impl Into<String>, spec: MatchSpec) -> Self {
        Self::new(table, Action::Delete, chain, spec)
    }

    pub fn check(table: Table, chain: impl Into<String>, spec: MatchSpec) -> Self {
        Self::new(table, Action::Check, chain, spec)
    }

    /// Retargets the directive at ip6tables
    pub fn ipv6(mut self) -> Self {
        self.family = Family::Ipv6;
        self
    }

    /// Attaches an annotation; `None` leaves the directive unannotated
    pub fn annotated(mut self, annotation: Option<String>) -> Self {
        self.annotation = annotation;
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn spec(&self) -> &MatchSpec {
        &self.spec
    }

    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    /// Renders the directive to iptables argv (without the program name).
    ///
    /// Shape: `[-w] -t <table> <flag> <chain> [match...] [-m comment --comment <annotation>]`.
    /// The comment fragment is omitted entirely without comment support.
    pub fn to_args(&self, flags: &FeatureFlags) -> Vec<String> {
        let mut args = Vec::with_capacity(8 + self.spec.tokens().len());
        if flags.supports_wait {
            args.push("-w".to_string());
        }
        args.push("-t".to_string());
        args.push(self.table.as_ref().to_string());
        args.push(self.action.flag().to_string());
        args.push(self.chain.clone());
        args.extend(self.spec.tokens().iter().cloned());
        if flags.supports_comment
            && let Some(annotation) = &self.annotation
        {
            args.push("-m".to_string());
            args.push("comment".to_string());
            args.push("--comment".to_string());
            args.push(annotation.clone());
        }
        args
    }

    /// Renders a human-readable command line (annotation quoted) for logs and dry runs
    pub fn render(&self, flags: &FeatureFlags) -> String {
        let program = match self.family {
            Family::Ipv4 => "iptables",
            Family::Ipv6 => "ip6tables",
        };
        let args: Vec<String> = self
            .to_args(flags)
            .into_iter()
            .map(|a| if a.contains(' ') { format!("\"{a}\"") } else { a })
            .collect();
        format!("{program} {}", args.join(" "))
    }
}

impl PartialEq for Directive {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family
            && self.table == other.table
            && self.chain == other.chain
            && self.action == other.action
            && self.spec == other.spec
    }
}

impl Eq for Directive {}

impl Hash for Directive {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.table.hash(state);
        self.chain.hash(state);
        self.action.hash(state);
        self.spec.hash(state);
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] -t {} {} {}",
            self.family,
            self.table,
            self.action.flag(),
            self.chain
        )?;
        if !self.spec.is_empty() {
            write!(f, " {}", self.spec)?;
        }
        Ok(())
    }
}

/// Ordered, append-only sequence of directives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    directives: Vec<Directive>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, directive: Directive) {
        self.directives.push(directive);
    }

    /// Appends every directive of `other`, preserving its order
    pub fn append(&mut self, other: RuleSet) {
        self.directives.extend(other.directives);
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Directive> {
        self.directives.iter()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Rendered command lines, one per directive
    pub fn render_lines(&self, flags: &FeatureFlags) -> Vec<String> {
        self.directives.iter().map(|d| d.render(flags)).collect()
    }

    /// SHA-256 over the rendered argv of every directive, in order.
    ///
    /// Identical RuleSets rendered with identical flags always share a fingerprint.
    pub fn fingerprint(&self, flags: &FeatureFlags) -> String {
        let mut hasher = Sha256::new();
        for directive in &self.directives {
            hasher.update(directive.family.as_ref().as_bytes());
            for arg in directive.to_args(flags) {
                hasher.update(arg.as_bytes());
                hasher.update([0u8]);
            }
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

impl FromIterator<Directive> for RuleSet {
    fn from_iter<I: IntoIterator<Item = Directive>>(iter: I) -> Self {
        Self {
            directives: iter.into_iter().collect(),
        }
    }
}

impl Extend<Directive> for RuleSet {
    fn extend<I: IntoIterator<Item = Directive>>(&mut self, iter: I) {
        self.directives.extend(iter);
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Directive;
    type IntoIter = std::slice::Iter<'a, Directive>;

    fn into_iter(self) -> Self::IntoIter {
        self.directives.iter()
    }
}
