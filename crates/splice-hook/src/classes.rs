// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Class delegation table.
//!
//! While a category is on, its companion class is linked under the host
//! class it stands in for, so `is_a` checks against the host class accept
//! companion objects. Links are consulted at call time; detaching puts the
//! companion's own parent back.

use indexmap::IndexMap;

use crate::error::HookError;

#[derive(Debug, Clone, Default)]
pub struct ClassLinks {
    /// class -> declared parent
    classes: IndexMap<String, Option<String>>,
    /// child -> parent it had before `attach`
    attached: IndexMap<String, Option<String>>,
}

impl ClassLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, parent: Option<&str>) {
        self.classes.insert(name.to_string(), parent.map(str::to_string));
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.classes.get(name).and_then(|p| p.as_deref())
    }

    /// Make `child` a subclass of `parent`. Attaching twice is harmless.
    pub fn attach(&mut self, child: &str, parent: &str) -> Result<(), HookError> {
        for name in [child, parent] {
            if !self.is_defined(name) {
                return Err(HookError::ClassNotFound(name.to_string()));
            }
        }
        if self.attached.contains_key(child) {
            return Ok(());
        }
        let previous = self.classes.insert(child.to_string(), Some(parent.to_string())).flatten();
        self.attached.insert(child.to_string(), previous);
        tracing::debug!(child, parent, "class linked");
        Ok(())
    }

    pub fn detach(&mut self, child: &str) -> bool {
        let Some(previous) = self.attached.shift_remove(child) else {
            return false;
        };
        if let Some(slot) = self.classes.get_mut(child) {
            *slot = previous;
        }
        tracing::debug!(child, "class unlinked");
        true
    }

    pub fn detach_all(&mut self) {
        let children: Vec<String> = self.attached.keys().cloned().collect();
        for child in children {
            self.detach(&child);
        }
    }

    pub fn is_attached(&self, child: &str) -> bool {
        self.attached.contains_key(child)
    }

    /// Walks the parent chain.
    pub fn is_a(&self, class: &str, ancestor: &str) -> bool {
        let mut current = Some(class);
        let mut steps = 0;
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.classes.len() {
                return false;
            }
            current = self.parent_of(name);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links() -> ClassLinks {
        let mut links = ClassLinks::new();
        links.define("Socket", None);
        links.define("Swoole\\Coroutine\\Socket", Some("Base"));
        links.define("Base", None);
        links
    }

    #[test]
    fn attach_and_detach() {
        let mut links = links();
        assert!(!links.is_a("Swoole\\Coroutine\\Socket", "Socket"));
        links.attach("Swoole\\Coroutine\\Socket", "Socket").unwrap();
        assert!(links.is_a("Swoole\\Coroutine\\Socket", "Socket"));

        assert!(links.detach("Swoole\\Coroutine\\Socket"));
        assert!(!links.detach("Swoole\\Coroutine\\Socket"));
        assert_eq!(links.parent_of("Swoole\\Coroutine\\Socket"), Some("Base"));
    }

    #[test]
    fn missing_class_is_reported() {
        let mut links = links();
        assert_eq!(
            links.attach("Swoole\\Curl\\Handler", "CurlHandle"),
            Err(HookError::ClassNotFound("Swoole\\Curl\\Handler".into()))
        );
        assert!(!links.is_attached("Swoole\\Curl\\Handler"));
    }

    #[test]
    fn cycles_terminate() {
        let mut links = ClassLinks::new();
        links.define("A", Some("B"));
        links.define("B", Some("A"));
        assert!(!links.is_a("A", "C"));
    }
}
