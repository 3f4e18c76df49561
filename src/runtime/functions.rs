//! Native function registry
//!
//! Functions the in-process runtime can execute on behalf of a caller holding
//! the global lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Values passed into and out of runtime functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    List(Arc<[i64]>),
    Str(Arc<str>),
}

impl Value {
    /// Build a list value.
    pub fn list<I: IntoIterator<Item = i64>>(items: I) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Build a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[i64]> {
        match self {
            Value::List(items) => Some(&**items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(&**s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::List(_) => "list",
            Value::Str(_) => "str",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::List(items) => write!(f, "[{} items]", items.len()),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Runtime global variables, only touched under the global lock.
pub type Globals = HashMap<String, Value>;

/// A native function. `Err` carries the message of a raised failure.
pub type NativeFunction = Arc<dyn Fn(&mut Globals, &[Value]) -> Result<Value, String> + Send + Sync>;

/// Name to function table.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, NativeFunction>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registry pre-populated with the builtin functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.init_builtins();
        registry
    }

    /// Register (or replace) a function.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        func: F,
    ) where
        F: Fn(&mut Globals, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
    }

    /// Look up a function.
    pub fn get(
        &self,
        name: &str,
    ) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn init_builtins(&mut self) {
        self.register("sum", builtin_sum);
        self.register("total", builtin_total);
        self.register("update_status", builtin_update_status);
        self.register("set_global", builtin_set_global);
        self.register("get_global", builtin_get_global);
        self.register("raise", builtin_raise);
    }
}

// === builtins ===

/// Element-wise sum of two equally long lists.
fn builtin_sum(
    _globals: &mut Globals,
    args: &[Value],
) -> Result<Value, String> {
    let (lhs, rhs) = match args {
        [lhs, rhs] => (list_arg(lhs, 0)?, list_arg(rhs, 1)?),
        _ => return Err(format!("sum() takes 2 arguments ({} given)", args.len())),
    };
    if lhs.len() != rhs.len() {
        return Err(format!(
            "operands could not be broadcast together with lengths {} and {}",
            lhs.len(),
            rhs.len()
        ));
    }
    let items = lhs
        .iter()
        .zip(rhs)
        .map(|(a, b)| a.checked_add(*b).ok_or_else(|| overflow("sum")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::list(items))
}

/// Total of all integers in the arguments, lists included.
fn builtin_total(
    _globals: &mut Globals,
    args: &[Value],
) -> Result<Value, String> {
    let mut total = 0i64;
    for (idx, arg) in args.iter().enumerate() {
        let part = match arg {
            Value::Int(n) => *n,
            Value::List(items) => items
                .iter()
                .try_fold(0i64, |acc, n| acc.checked_add(*n))
                .ok_or_else(|| overflow("total"))?,
            other => {
                return Err(format!(
                    "total() argument {} must be int or list, not {}",
                    idx,
                    other.type_name()
                ))
            }
        };
        total = total.checked_add(part).ok_or_else(|| overflow("total"))?;
    }
    Ok(Value::Int(total))
}

/// Record which worker thread last reported in.
fn builtin_update_status(
    globals: &mut Globals,
    args: &[Value],
) -> Result<Value, String> {
    let thread_idx = match args.first().and_then(Value::as_int) {
        Some(idx) => idx,
        None => return Err("update_status() expects a thread index".to_string()),
    };
    let updates = globals
        .get("status_updates")
        .and_then(Value::as_int)
        .unwrap_or(0)
        + 1;
    globals.insert("status_updates".to_string(), Value::Int(updates));
    globals.insert(
        "status".to_string(),
        Value::str(format!("Thread {} called. Update number {}", thread_idx, updates)),
    );
    Ok(Value::Int(updates))
}

fn builtin_set_global(
    globals: &mut Globals,
    args: &[Value],
) -> Result<Value, String> {
    match args {
        [Value::Str(name), value] => Ok(globals
            .insert(name.to_string(), value.clone())
            .unwrap_or(Value::Unit)),
        _ => Err("set_global() expects a name and a value".to_string()),
    }
}

fn builtin_get_global(
    globals: &mut Globals,
    args: &[Value],
) -> Result<Value, String> {
    match args {
        [Value::Str(name)] => globals
            .get(&**name)
            .cloned()
            .ok_or_else(|| format!("name '{}' is not defined", name)),
        _ => Err("get_global() expects a name".to_string()),
    }
}

/// Always fails; used to exercise failure propagation.
fn builtin_raise(
    _globals: &mut Globals,
    args: &[Value],
) -> Result<Value, String> {
    let message = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("exception raised");
    Err(message.to_string())
}

fn overflow(function: &str) -> String {
    format!("integer overflow in {}()", function)
}

fn list_arg(
    value: &Value,
    idx: usize,
) -> Result<&[i64], String> {
    value
        .as_list()
        .ok_or_else(|| format!("argument {} must be list, not {}", idx, value.type_name()))
}
