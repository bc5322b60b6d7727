//! Browser tabs as seen from the relay: a way to find the tab hosting the
//! observer and to hand it a runtime message without waiting for an answer.

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::events::RuntimeMessage;

pub type TabId = u32;

/// Pages the observer runs on.
pub const WATCH_PAGE_PATTERN: &str = "*://www.youtube.com/watch*";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no tab matches {0}")]
    NoMatchingTab(String),
    #[error("tab {0} is gone")]
    TabClosed(TabId),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid match pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pattern: String,
    reason: &'static str,
}

/// A `<scheme>://<host><path>` pattern in the browser extension style.
///
/// A `*` scheme stands for `http` or `https`, a `*.` host prefix for any
/// subdomain, and `*` in the path for any run of characters. The path is
/// matched against the URL's path plus its query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    raw: String,
    scheme: String,
    host: String,
    path: String,
}

impl FromStr for MatchPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| PatternError {
            pattern: s.to_owned(),
            reason,
        };
        let (scheme, rest) = s.split_once("://").ok_or_else(|| err("missing ://"))?;
        let slash = rest.find('/').ok_or_else(|| err("missing path"))?;
        let (host, path) = rest.split_at(slash);
        if scheme.is_empty() || host.is_empty() {
            return Err(err("empty scheme or host"));
        }
        if host.contains('*') && !(host == "*" || (host.starts_with("*.") && !host[2..].contains('*'))) {
            return Err(err("host wildcard must be a leading *."));
        }
        Ok(Self {
            raw: s.to_owned(),
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            path: path.to_owned(),
        })
    }
}

impl MatchPattern {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, url: &Url) -> bool {
        let scheme_ok = match self.scheme.as_str() {
            "*" => matches!(url.scheme(), "http" | "https"),
            scheme => url.scheme() == scheme,
        };
        if !scheme_ok {
            return false;
        }

        let Some(host) = url.host_str() else {
            return false;
        };
        let host_ok = if self.host == "*" {
            true
        } else if let Some(base) = self.host.strip_prefix("*.") {
            host == base || host.ends_with(&format!(".{base}"))
        } else {
            host == self.host
        };
        if !host_ok {
            return false;
        }

        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        glob_match(&self.path, &target)
    }
}

/// `*`-only glob, greedy with backtracking to the last star.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Url,
    pub active: bool,
}

pub trait TabHost: Send + Sync {
    /// Matching tabs, in tab order.
    fn query(&self, pattern: &MatchPattern) -> Vec<TabInfo>;

    /// Queues a message for the tab's content context. Never waits for it
    /// to be handled.
    fn send_message(&self, tab: TabId, message: RuntimeMessage) -> Result<(), DispatchError>;
}

/// The focused tab if one matches, else the first match.
pub fn select_target(tabs: &[TabInfo]) -> Option<&TabInfo> {
    tabs.iter().find(|tab| tab.active).or_else(|| tabs.first())
}

struct Tab {
    url: Url,
    active: bool,
    inbox: mpsc::UnboundedSender<RuntimeMessage>,
}

/// In-process tab host. Each opened tab gets an inbox that its observer
/// drains.
#[derive(Default)]
pub struct TabRegistry {
    inner: Mutex<Tabs>,
}

#[derive(Default)]
struct Tabs {
    next_id: TabId,
    open: BTreeMap<TabId, Tab>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tabs(&self) -> MutexGuard<'_, Tabs> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a tab at `url`. An active tab takes focus from all others.
    pub fn open(&self, url: Url, active: bool) -> (TabId, mpsc::UnboundedReceiver<RuntimeMessage>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let mut tabs = self.tabs();
        tabs.next_id += 1;
        let id = tabs.next_id;
        if active {
            tabs.open.values_mut().for_each(|t| t.active = false);
        }
        tabs.open.insert(id, Tab { url, active, inbox });
        (id, rx)
    }

    pub fn activate(&self, id: TabId) {
        let mut tabs = self.tabs();
        if tabs.open.contains_key(&id) {
            for (tab_id, tab) in tabs.open.iter_mut() {
                tab.active = *tab_id == id;
            }
        }
    }

    pub fn navigate(&self, id: TabId, url: Url) {
        if let Some(tab) = self.tabs().open.get_mut(&id) {
            tab.url = url;
        }
    }

    pub fn close(&self, id: TabId) {
        self.tabs().open.remove(&id);
    }
}

impl TabHost for TabRegistry {
    fn query(&self, pattern: &MatchPattern) -> Vec<TabInfo> {
        self.tabs()
            .open
            .iter()
            .filter(|(_, tab)| pattern.matches(&tab.url))
            .map(|(id, tab)| TabInfo {
                id: *id,
                url: tab.url.clone(),
                active: tab.active,
            })
            .collect()
    }

    fn send_message(&self, tab: TabId, message: RuntimeMessage) -> Result<(), DispatchError> {
        let tabs = self.tabs();
        let entry = tabs.open.get(&tab).ok_or(DispatchError::TabClosed(tab))?;
        entry
            .inbox
            .send(message)
            .map_err(|_| DispatchError::TabClosed(tab))
    }
}
