use std::collections::BTreeMap;

/// The kinds of value a command line switch can take.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Text(String),
    Integer(i64),
    Real(f64),
    /// `true` sets a presence-only switch, `false` removes the flag.
    Switch(bool),
}

impl FlagValue {
    /// Value token for this flag. `None` means the flag must be removed, an
    /// empty string means the flag is emitted without a value token.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.clone()),
            Self::Integer(value) => Some(value.to_string()),
            Self::Real(value) => Some(render_real(*value)),
            Self::Switch(true) => Some(String::new()),
            Self::Switch(false) => None,
        }
    }
}

/// Shortest round-trip form, switching to exponent notation outside
/// `[1e-4, 1e21)` so tiny e-value cutoffs stay short tokens.
fn render_real(value: f64) -> String {
    let magnitude = value.abs();
    if value.is_finite() && magnitude != 0.0 && !(1e-4..1e21).contains(&magnitude) {
        format!("{value:e}")
    } else {
        value.to_string()
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for FlagValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        Self::Switch(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<f32> for FlagValue {
    fn from(value: f32) -> Self {
        Self::Real(value as f64)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FlagValue {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<u32> for FlagValue {
    fn from(value: u32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<usize> for FlagValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// Named command line switches, stored without the leading dash.
///
/// Rendering is sorted by name so argument lists are reproducible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flags {
    values: BTreeMap<String, String>,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, replacing any earlier value. `false` removes
    /// the flag.
    pub fn set(&mut self, name: &str, value: impl Into<FlagValue>) {
        match value.into().render() {
            Some(rendered) => {
                self.values.insert(name.to_string(), rendered);
            }
            None => {
                self.values.remove(name);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// `-name [value]` tokens, one pair per flag.
    pub fn cmd_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.values.len() * 2);
        for (name, value) in &self.values {
            args.push(format!("-{name}"));
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        args
    }
}
