//! Lexical frames.
//!
//! A frame is an insertion-ordered list of bindings plus an optional parent. A frame owns
//! its parent, and the parent is fixed when the frame is created, so parent chains always
//! end at the root frame and cannot form cycles. The only mutation is adding a binding;
//! existing entries are never rewritten or removed, and a later binding of the same name
//! shadows the earlier one.
//!
//! Closures do not own the frame they were created in. They hold a [`CapturedFrame`],
//! and the captured frame is kept alive by the frame store shared by every [`Environment`]
//! handle descending from the same root. A binding that holds a closure therefore never
//! keeps its own frame alive, and dropping the last handle (usually the interpreter's
//! global environment) frees every frame and closure of the session.

use crate::Error;
use crate::ast::{OperationFn, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

struct Frame {
    bindings: RefCell<Vec<(String, Value)>>,
    parent: Option<Rc<Frame>>,
    /// Set once the frame store holds this frame
    retained: Cell<bool>,
}

impl Frame {
    fn new(parent: Option<Rc<Frame>>) -> Rc<Frame> {
        Rc::new(Frame {
            bindings: RefCell::new(Vec::new()),
            parent,
            retained: Cell::new(false),
        })
    }

    /// Binding of `name` in this frame only
    fn local(&self, name: &str) -> Option<Value> {
        self.bindings
            .borrow()
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }
}

/// Owner of every frame some closure was created in
#[derive(Default)]
struct FrameStore {
    captured: RefCell<Vec<Rc<Frame>>>,
}

/// Shared handle to a frame; cloning it does not copy any bindings
#[derive(Clone)]
pub struct Environment {
    frame: Rc<Frame>,
    store: Rc<FrameStore>,
}

/// A closure's non-owning reference to its defining frame
#[derive(Clone)]
pub struct CapturedFrame {
    frame: Weak<Frame>,
    store: Weak<FrameStore>,
}

impl CapturedFrame {
    /// Handle to the captured frame, or `None` once the environment it belonged to is gone
    pub fn upgrade(&self) -> Option<Environment> {
        Some(Environment {
            frame: self.frame.upgrade()?,
            store: self.store.upgrade()?,
        })
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("live", &(self.frame.strong_count() > 0))
            .finish()
    }
}

impl Environment {
    /// A root frame with no parent, and a new frame store
    pub fn new() -> Self {
        Environment {
            frame: Frame::new(None),
            store: Rc::new(FrameStore::default()),
        }
    }

    /// An empty child frame of `parent`
    pub fn with_parent(parent: &Environment) -> Self {
        Environment {
            frame: Frame::new(Some(Rc::clone(&parent.frame))),
            store: Rc::clone(&parent.store),
        }
    }

    pub fn parent(&self) -> Option<Environment> {
        self.frame.parent.as_ref().map(|parent| Environment {
            frame: Rc::clone(parent),
            store: Rc::clone(&self.store),
        })
    }

    /// Hand out a reference to this frame for a closure created in it. The frame store
    /// keeps the frame, and so its whole parent chain, alive from now on.
    pub fn capture(&self) -> CapturedFrame {
        if !self.frame.retained.replace(true) {
            self.store.captured.borrow_mut().push(Rc::clone(&self.frame));
        }
        CapturedFrame {
            frame: Rc::downgrade(&self.frame),
            store: Rc::downgrade(&self.store),
        }
    }

    /// Add a binding to this frame. Uniqueness is not enforced; the newest binding
    /// of a name wins on lookup.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.frame.bindings.borrow_mut().push((name.into(), value));
    }

    /// Find the innermost binding of `name`, walking up the parent chain
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Some(&self.frame);
        while let Some(frame) = current {
            if let Some(value) = frame.local(name) {
                return Some(value);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Like [`Environment::get`], failing with `UnboundIdentifier` when no frame binds `name`
    pub fn lookup(&self, name: &str) -> Result<Value, Error> {
        self.get(name)
            .ok_or_else(|| Error::UnboundIdentifier(name.to_owned()))
    }

    /// Build the frame of a `let`: a new child of `self` holding one binding per clause.
    ///
    /// Every initialiser is handed to `eval_init` together with `self`, the frame active
    /// before the `let`, so clauses cannot see each other. A name that appears in two
    /// clauses fails with `DuplicateBinding` before its initialiser is evaluated.
    pub fn bind_let<F>(&self, clauses: &[(String, Value)], mut eval_init: F) -> Result<Self, Error>
    where
        F: FnMut(&Value, &Environment) -> Result<Value, Error>,
    {
        let frame = Environment::with_parent(self);
        for (name, init) in clauses {
            if frame.frame.local(name).is_some() {
                return Err(Error::DuplicateBinding(name.clone()));
            }
            let value = eval_init(init, self)?;
            frame.define(name.clone(), value);
        }
        Ok(frame)
    }

    /// Register a custom native procedure in this frame.
    ///
    /// # Example
    /// ```
    /// use schemexp::{Error, Value, create_global_env};
    ///
    /// let env = create_global_env();
    /// env.register_builtin_function("answer", |_args: &[Value]| -> Result<Value, Error> {
    ///     Ok(Value::Integer(42))
    /// });
    /// assert!(env.get("answer").is_some());
    /// ```
    pub fn register_builtin_function<F>(&self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, Error> + 'static,
    {
        let func: Rc<OperationFn> = Rc::new(func);
        self.define(
            name,
            Value::Primitive {
                name: name.to_owned(),
                func,
            },
        );
    }

    /// All bindings visible from this frame, shadowed ones excluded,
    /// sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();

        let mut current = Some(&self.frame);
        while let Some(frame) = current {
            for (name, value) in frame.bindings.borrow().iter().rev() {
                if seen.insert(name.clone()) {
                    result.push((name.clone(), value.clone()));
                }
            }
            current = frame.parent.as_ref();
        }

        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    /// Whether two handles refer to the same frame
    pub fn ptr_eq(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.frame, &other.frame)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Names only: values may hold closures defined in this very frame
        let bindings = self.frame.bindings.borrow();
        let names: Vec<&str> = bindings.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Environment")
            .field("names", &names)
            .field("has_parent", &self.frame.parent.is_some())
            .finish()
    }
}
