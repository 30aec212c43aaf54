//! Convenience macros for building query parameters.
//!
//! The macros expand at compile time into plain `BTreeMap` construction, so
//! call sites read like the parameter maps of the query language itself.

/// Build a [`Params`](crate::models::Params) map.
///
/// Values go through `Into<Value>`, so literals, strings, vectors and nested
/// `params!` maps can be mixed freely.
///
/// # Example
///
/// ```ignore
/// let query = Query::with_params(
///     "CREATE (p:Person {name: $name, age: $age}) RETURN p",
///     params! { "name" => "Michael", "age" => 42 },
/// );
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::models::Params::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut params = $crate::models::Params::new();
        $(
            params.insert(
                ::std::string::String::from($key),
                $crate::models::Value::from($value),
            );
        )+
        params
    }};
}
