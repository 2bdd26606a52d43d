//! Capability table: who a talker is and what it can be asked to do.
//!
//! Built by the application and moved into the engine, which reads and calls
//! entries but never adds or removes them.

use std::fmt;

use crate::message::{Message, Value};
use crate::protocol::{key, MessageCode};

/// Action callable. Returns false when the action failed.
pub type RunFn = Box<dyn FnMut(&mut Message) -> bool + Send>;
/// Setter callable; receives the integer `v` of the request.
pub type SetFn = Box<dyn FnMut(&mut Message, u64) -> bool + Send>;
/// Getter callable; the returned value is sent back as `v`.
pub type GetFn = Box<dyn FnMut(&mut Message) -> Value + Send>;
/// Echo or error observer.
pub type Callback = Box<dyn FnMut(&Message) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Talker {
    pub name: String,
    pub description: String,
}

/// Entry group, carried as `a` in LIST replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Run,
    Set,
    Get,
}

impl Group {
    pub fn code(self) -> MessageCode {
        match self {
            Group::Run => MessageCode::Run,
            Group::Set => MessageCode::Set,
            Group::Get => MessageCode::Get,
        }
    }
}

pub struct Entry<F> {
    pub name: String,
    pub description: String,
    callable: F,
}

impl<F> Entry<F> {
    fn new(name: &str, description: &str, callable: F) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            callable,
        }
    }
}

/// A listed entry: group, position within the group, name, description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing<'a> {
    pub group: Group,
    pub index: usize,
    pub name: &'a str,
    pub description: &'a str,
}

pub struct Manifest {
    talker: Talker,
    run: Vec<Entry<RunFn>>,
    set: Vec<Entry<SetFn>>,
    get: Vec<Entry<GetFn>>,
    echo: Option<Callback>,
    error: Option<Callback>,
}

impl Manifest {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            talker: Talker {
                name: name.to_string(),
                description: description.to_string(),
            },
            run: Vec::new(),
            set: Vec::new(),
            get: Vec::new(),
            echo: None,
            error: None,
        }
    }

    pub fn run<F>(mut self, name: &str, description: &str, f: F) -> Self
    where
        F: FnMut(&mut Message) -> bool + Send + 'static,
    {
        self.run.push(Entry::new(name, description, Box::new(f)));
        self
    }

    pub fn set<F>(mut self, name: &str, description: &str, f: F) -> Self
    where
        F: FnMut(&mut Message, u64) -> bool + Send + 'static,
    {
        self.set.push(Entry::new(name, description, Box::new(f)));
        self
    }

    pub fn get<F>(mut self, name: &str, description: &str, f: F) -> Self
    where
        F: FnMut(&mut Message) -> Value + Send + 'static,
    {
        self.get.push(Entry::new(name, description, Box::new(f)));
        self
    }

    pub fn on_echo<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.echo = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.error = Some(Box::new(f));
        self
    }

    pub fn talker(&self) -> &Talker {
        &self.talker
    }

    pub fn name(&self) -> &str {
        &self.talker.name
    }

    pub fn description(&self) -> &str {
        &self.talker.description
    }

    fn names(&self, group: Group) -> Vec<&str> {
        match group {
            Group::Run => self.run.iter().map(|e| e.name.as_str()).collect(),
            Group::Set => self.set.iter().map(|e| e.name.as_str()).collect(),
            Group::Get => self.get.iter().map(|e| e.name.as_str()).collect(),
        }
    }

    fn group_len(&self, group: Group) -> usize {
        match group {
            Group::Run => self.run.len(),
            Group::Set => self.set.len(),
            Group::Get => self.get.len(),
        }
    }

    /// Entry targeted by `message`: by name (`n`) if present, else by index (`x`).
    pub fn lookup(&self, group: Group, message: &Message) -> Option<usize> {
        if let Some(name) = message.get_text(key::NAME) {
            return self.names(group).iter().position(|n| *n == name);
        }
        let index = usize::try_from(message.get_integer(key::INDEX)?).ok()?;
        (index < self.group_len(group)).then_some(index)
    }

    pub fn call_run(&mut self, index: usize, message: &mut Message) -> Option<bool> {
        let entry = self.run.get_mut(index)?;
        Some((entry.callable)(message))
    }

    pub fn call_set(&mut self, index: usize, message: &mut Message, value: u64) -> Option<bool> {
        let entry = self.set.get_mut(index)?;
        Some((entry.callable)(message, value))
    }

    pub fn call_get(&mut self, index: usize, message: &mut Message) -> Option<Value> {
        let entry = self.get.get_mut(index)?;
        Some((entry.callable)(message))
    }

    /// Name of the entry at `index`, for annotating replies.
    pub fn entry_name(&self, group: Group, index: usize) -> Option<&str> {
        self.names(group).get(index).copied()
    }

    /// Every entry, run first, then set, then get.
    pub fn entries(&self) -> Vec<Listing<'_>> {
        fn listing<F>(group: Group, entries: &[Entry<F>]) -> impl Iterator<Item = Listing<'_>> {
            entries.iter().enumerate().map(move |(index, e)| Listing {
                group,
                index,
                name: &e.name,
                description: &e.description,
            })
        }
        listing(Group::Run, &self.run)
            .chain(listing(Group::Set, &self.set))
            .chain(listing(Group::Get, &self.get))
            .collect()
    }

    /// Entry counts as `[run, set, get]`.
    pub fn counts(&self) -> [usize; 3] {
        [self.run.len(), self.set.len(), self.get.len()]
    }

    /// Hand an echo to the application. Returns false when no callback is set.
    pub fn deliver_echo(&mut self, message: &Message) -> bool {
        match self.echo.as_mut() {
            Some(f) => {
                f(message);
                true
            }
            None => false,
        }
    }

    pub fn deliver_error(&mut self, message: &Message) -> bool {
        match self.error.as_mut() {
            Some(f) => {
                f(message);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("talker", &self.talker)
            .field("run", &self.names(Group::Run))
            .field("set", &self.names(Group::Set))
            .field("get", &self.names(Group::Get))
            .field("echo", &self.echo.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}
