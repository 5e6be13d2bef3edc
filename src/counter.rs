use serde::{Deserialize, Serialize};

pub const DEFAULT_NAME: &str = "React Developer";

/// Counter and greeting widget shown next to the todo screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub count: i64,
    pub name: String,
}

impl Default for Counter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Counter {
    #[must_use]
    pub fn new(initial: i64) -> Self {
        Self {
            count: initial,
            name: DEFAULT_NAME.to_string(),
        }
    }

    pub fn increment(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn decrement(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub fn greeting(&self) -> String {
        format!("Hello, {}!", self.name)
    }

    /// Document title; refreshed whenever the count changes.
    #[must_use]
    pub fn title(&self) -> String {
        format!("Count: {}", self.count)
    }
}
