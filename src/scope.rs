//! Lexical environments.
//!
//! [`VariableScope`] is a stack of name -> value frames searched innermost
//! first. It backs the type scope of the checker and the value and stream
//! scopes of the evaluator.
//!
//! [`ImplicitValue`] holds at most one value per frame: the current row of a
//! predicate or mapping body. Only the innermost frame is ever visible.
//!
//! Frames are pushed through guards that pop on drop, so every exit path
//! (including `?` propagation) restores the enclosing frame.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone)]
pub struct VariableScope<T> {
    // Innermost frame last.
    scopes: Vec<HashMap<String, T>>,
}

impl<T> Default for VariableScope<T> {
    fn default() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }
}

impl<T> VariableScope<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` in the innermost frame, replacing a binding of the same
    /// name in that frame.
    pub fn put_in_scope(&mut self, name: impl Into<String>, value: T) {
        if let Some(frame) = self.scopes.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.scopes.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn is_in_scope(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pop the innermost frame. The outermost frame is never removed.
    pub fn pop(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popping the outermost scope");
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Push a frame that is popped when the guard is dropped.
    pub fn new_scope(&mut self) -> NewScope<'_, T> {
        self.push();
        NewScope { parent: self }
    }
}

impl<T: Clone> VariableScope<T> {
    /// Flatten all visible bindings; inner bindings shadow outer ones.
    pub fn dump(&self) -> HashMap<String, T> {
        let mut map = HashMap::new();
        for frame in self.scopes.iter().rev() {
            for (name, value) in frame {
                map.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        map
    }
}

pub struct NewScope<'a, T> {
    parent: &'a mut VariableScope<T>,
}

impl<T> Deref for NewScope<'_, T> {
    type Target = VariableScope<T>;

    fn deref(&self) -> &Self::Target {
        self.parent
    }
}

impl<T> DerefMut for NewScope<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.parent
    }
}

impl<T> Drop for NewScope<'_, T> {
    fn drop(&mut self) {
        self.parent.pop();
    }
}

#[derive(Debug, Clone)]
pub struct ImplicitValue<T> {
    // Innermost frame last.
    scopes: Vec<Option<T>>,
}

impl<T> Default for ImplicitValue<T> {
    fn default() -> Self {
        Self { scopes: vec![None] }
    }
}

impl<T> ImplicitValue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_value(&self) -> bool {
        matches!(self.scopes.last(), Some(Some(_)))
    }

    /// Value of the innermost frame. Outer frames are never consulted.
    pub fn get_value(&self) -> Option<&T> {
        self.scopes.last().and_then(|slot| slot.as_ref())
    }

    pub fn push(&mut self) {
        self.scopes.push(None);
    }

    pub fn push_value(&mut self, value: T) {
        self.scopes.push(Some(value));
    }

    pub fn pop(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popping the outermost implicit frame");
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Push a frame holding `value`, popped when the guard is dropped.
    pub fn impliciter(&mut self, value: T) -> Impliciter<'_, T> {
        self.push_value(value);
        Impliciter { parent: self }
    }

    /// Push an empty frame, hiding any outer implicit value.
    pub fn empty_frame(&mut self) -> Impliciter<'_, T> {
        self.push();
        Impliciter { parent: self }
    }
}

pub struct Impliciter<'a, T> {
    parent: &'a mut ImplicitValue<T>,
}

impl<T> Deref for Impliciter<'_, T> {
    type Target = ImplicitValue<T>;

    fn deref(&self) -> &Self::Target {
        self.parent
    }
}

impl<T> DerefMut for Impliciter<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.parent
    }
}

impl<T> Drop for Impliciter<'_, T> {
    fn drop(&mut self) {
        self.parent.pop();
    }
}
