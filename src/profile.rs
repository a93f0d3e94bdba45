//! Local display-name state, read fresh at every call site instead of
//! captured by a closure (the source reads a mutable display name via a
//! closure; this crate passes a shared reference to read at call time).

use std::sync::RwLock;

pub struct Profile {
    display_name: RwLock<String>,
}

impl Profile {
    pub fn new(display_name: String) -> Self {
        Self { display_name: RwLock::new(display_name) }
    }

    pub fn display_name(&self) -> String {
        self.display_name.read().unwrap().clone()
    }

    pub fn set_display_name(&self, name: String) {
        *self.display_name.write().unwrap() = name;
    }
}
