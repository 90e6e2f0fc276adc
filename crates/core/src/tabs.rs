use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::results::QueryResult;

const HOME_TITLE: &str = "Home";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TabKind {
    Query,
    Home,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    pub title: String,
    pub kind: TabKind,
    #[serde(default)]
    pub content: String,
    #[serde(skip)]
    pub last_result: Option<QueryResult>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TabError {
    #[error("tab index {index} is out of range for {len} tabs")]
    Index { index: usize, len: usize },
    #[error("tab `{0}` was not found")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct TabSet {
    tabs: Vec<Tab>,
    active: String,
    query_counter: usize,
}

impl Default for TabSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TabSet {
    #[must_use]
    pub fn new() -> Self {
        let home = Tab {
            id: new_tab_id(),
            title: HOME_TITLE.to_string(),
            kind: TabKind::Home,
            content: String::new(),
            last_result: None,
        };
        Self {
            active: home.id.clone(),
            tabs: vec![home],
            query_counter: 0,
        }
    }

    /// Restores a persisted tab list; falls back to the default set when empty.
    #[must_use]
    pub fn from_tabs(tabs: Vec<Tab>, active: Option<&str>) -> Self {
        let mut unique: Vec<Tab> = Vec::with_capacity(tabs.len());
        for tab in tabs {
            if unique.iter().all(|existing| existing.id != tab.id) {
                unique.push(tab);
            }
        }
        let Some(first) = unique.first() else {
            return Self::new();
        };

        let active = active
            .filter(|id| unique.iter().any(|tab| tab.id == *id))
            .map_or_else(|| first.id.clone(), str::to_string);
        let query_counter = unique
            .iter()
            .filter(|tab| tab.kind == TabKind::Query)
            .count();
        Self {
            tabs: unique,
            active,
            query_counter,
        }
    }

    #[must_use]
    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.id == id)
    }

    #[must_use]
    pub fn active_id(&self) -> &str {
        &self.active
    }

    #[must_use]
    pub fn active(&self) -> Option<&Tab> {
        self.get(&self.active)
    }

    pub fn create(&mut self, kind: TabKind, content: Option<String>, title: Option<String>) -> &Tab {
        let title = title.unwrap_or_else(|| match kind {
            TabKind::Home => HOME_TITLE.to_string(),
            TabKind::Query => self.next_query_title(),
        });
        let tab = Tab {
            id: new_tab_id(),
            title,
            kind,
            content: content.unwrap_or_default(),
            last_result: None,
        };
        self.active = tab.id.clone();
        self.tabs.push(tab);
        &self.tabs[self.tabs.len() - 1]
    }

    pub fn close(&mut self, id: &str) -> Result<Tab, TabError> {
        let index = self.index_of(id)?;
        let removed = self.tabs.remove(index);

        if self.tabs.is_empty() {
            self.create(TabKind::Query, None, None);
        } else if self.active == removed.id {
            self.active = self.tabs[0].id.clone();
        }
        Ok(removed)
    }

    /// Closes everything except home tabs and activates the first home tab.
    pub fn close_all(&mut self) {
        self.tabs.retain(|tab| tab.kind == TabKind::Home);
        if let Some(home) = self.tabs.first() {
            self.active = home.id.clone();
        } else {
            self.create(TabKind::Query, None, None);
        }
    }

    pub fn set_active(&mut self, id: &str) -> Result<(), TabError> {
        self.index_of(id)?;
        self.active = id.to_string();
        Ok(())
    }

    pub fn update_content(&mut self, id: &str, content: impl Into<String>) -> Result<(), TabError> {
        self.tab_mut(id)?.content = content.into();
        Ok(())
    }

    pub fn update_title(&mut self, id: &str, title: impl Into<String>) -> Result<(), TabError> {
        self.tab_mut(id)?.title = title.into();
        Ok(())
    }

    pub fn attach_result(&mut self, id: &str, result: QueryResult) -> Result<(), TabError> {
        self.tab_mut(id)?.last_result = Some(result);
        Ok(())
    }

    pub fn move_tab(&mut self, from: usize, to: usize) -> Result<(), TabError> {
        let len = self.tabs.len();
        for index in [from, to] {
            if index >= len {
                return Err(TabError::Index { index, len });
            }
        }
        let tab = self.tabs.remove(from);
        self.tabs.insert(to, tab);
        Ok(())
    }

    fn next_query_title(&mut self) -> String {
        self.query_counter += 1;
        format!("Query {}", self.query_counter)
    }

    fn index_of(&self, id: &str) -> Result<usize, TabError> {
        self.tabs
            .iter()
            .position(|tab| tab.id == id)
            .ok_or_else(|| TabError::NotFound(id.to_string()))
    }

    fn tab_mut(&mut self, id: &str) -> Result<&mut Tab, TabError> {
        self.tabs
            .iter_mut()
            .find(|tab| tab.id == id)
            .ok_or_else(|| TabError::NotFound(id.to_string()))
    }
}

fn new_tab_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
