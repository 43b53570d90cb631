//! Class registry for the 36-way produce classifier.
//!
//! The order of `CLASS_NAMES` is fixed: index `i` corresponds to position `i`
//! in the model's output probability vector.

pub const CLASS_NAMES: [&str; 36] = [
    "apple",
    "banana",
    "beetroot",
    "bell pepper",
    "cabbage",
    "capsicum",
    "carrot",
    "cauliflower",
    "chilli pepper",
    "corn",
    "cucumber",
    "eggplant",
    "garlic",
    "ginger",
    "grapes",
    "jalepeno",
    "kiwi",
    "lemon",
    "lettuce",
    "mango",
    "onion",
    "orange",
    "paprika",
    "pear",
    "peas",
    "pineapple",
    "pomegranate",
    "potato",
    "raddish",
    "soy beans",
    "spinach",
    "sweetcorn",
    "sweetpotato",
    "tomato",
    "turnip",
    "watermelon",
];

/// Alternate spellings mapped to their canonical label. Not consulted by any
/// endpoint; kept alongside the registry for free-text lookups.
pub const CLASS_ALIASES: &[(&str, &[&str])] = &[
    ("bell pepper", &["bell_pepper", "bellpepper", "sweet pepper"]),
    ("chilli pepper", &["chili", "chili pepper", "hot pepper"]),
    ("jalepeno", &["jalapeño", "jalapeño pepper"]),
    ("raddish", &["radish"]),
    ("soy beans", &["soybean", "soybeans", "soy_beans"]),
    ("sweetcorn", &["sweet corn", "sweet_corn"]),
    ("sweetpotato", &["sweet potato", "sweet_potato"]),
];

/// Resolves a free-text label to its canonical registry entry, checking exact
/// names first and then the alias table. Matching is case-insensitive.
#[allow(dead_code)]
pub fn canonical_name(query: &str) -> Option<&'static str> {
    let query = query.trim().to_lowercase();
    if let Some(name) = CLASS_NAMES.iter().find(|name| **name == query) {
        return Some(name);
    }
    CLASS_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.iter().any(|alias| *alias == query))
        .map(|(canonical, _)| *canonical)
}

/// Looks up the label at a model output index, for out-of-range safety.
pub fn class_at(index: usize) -> &'static str {
    CLASS_NAMES.get(index).copied().unwrap_or("unknown")
}
