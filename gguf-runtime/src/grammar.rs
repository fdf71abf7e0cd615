//! Grammar sources for constrained sampling.
//!
//! Grammars are GBNF text with a `root` rule. JSON schemas are compiled into
//! GBNF through a [`GrammarCompiler`]; [`JsonSchemaCompiler`] covers the
//! common subset of JSON Schema (primitive types, `const`, `enum`, objects
//! with `properties`/`required`, arrays with `items`, `oneOf`/`anyOf`, local
//! `$ref`s and string length bounds).

use crate::error::{ModelError, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Compiles a JSON schema into grammar source
pub trait GrammarCompiler: Send + Sync {
    fn compile(&self, schema: &Value) -> Result<String>;
}

/// Built-in JSON-schema to GBNF compiler
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaCompiler;

impl GrammarCompiler for JsonSchemaCompiler {
    fn compile(&self, schema: &Value) -> Result<String> {
        let mut builder = RuleBuilder::new(schema);
        builder.visit(schema, "root")?;
        Ok(builder.render())
    }
}

const SPACE_RULE: &str = r#"| " " | "\n" [ \t]{0,20}"#;
const CHAR_RULE: &str = r#"[^"\\\x7F\x00-\x1F] | [\\] (["\\bfnrt] | "u" [0-9a-fA-F]{4})"#;

/// Shared rules, emitted on first use: (name, body, dependencies)
const PRIMITIVES: &[(&str, &str, &[&str])] = &[
    ("boolean", r#"("true" | "false") space"#, &["space"]),
    ("null", r#""null" space"#, &["space"]),
    ("integer", r#"("-"? ([0-9] | [1-9] [0-9]{0,15})) space"#, &["space"]),
    (
        "number",
        r#"("-"? ([0-9] | [1-9] [0-9]{0,15})) ("." [0-9]+)? ([eE] [-+]? [0-9] [0-9]{0,15})? space"#,
        &["space"],
    ),
    ("string", r#""\"" char* "\"" space"#, &["char", "space"]),
    ("char", CHAR_RULE, &[]),
    ("space", SPACE_RULE, &[]),
    (
        "value",
        "object | array | string | number | boolean | null",
        &["object", "array", "string", "number", "boolean", "null"],
    ),
    (
        "object",
        r#""{" space ( string ":" space value ("," space string ":" space value)* )? "}" space"#,
        &["string", "value", "space"],
    ),
    (
        "array",
        r#""[" space ( value ("," space value)* )? "]" space"#,
        &["value", "space"],
    ),
];

/// Value rules are named after their path from `root` (or `ref...` for
/// `$ref` targets); property key/value pairs live under a `kv-` prefix.
struct RuleBuilder<'a> {
    root_schema: &'a Value,
    rules: Vec<(String, String)>,
    index: HashMap<String, usize>,
    /// Names handed to `$ref` targets before their rule is defined
    reserved: HashSet<String>,
    /// `$ref` pointer to rule name
    refs: HashMap<String, String>,
}

impl<'a> RuleBuilder<'a> {
    fn new(root_schema: &'a Value) -> Self {
        Self {
            root_schema,
            rules: Vec::new(),
            index: HashMap::new(),
            reserved: HashSet::new(),
            refs: HashMap::new(),
        }
    }

    /// Add a rule and return the name it ended up under.
    ///
    /// A name already holding a different body gets a numeric suffix, so
    /// paths that sanitize to the same text never share a rule.
    fn add_rule(&mut self, name: &str, body: String) -> String {
        let mut key = name.to_string();
        let mut suffix = 0;
        loop {
            match self.index.get(&key) {
                Some(&i) if self.rules[i].1 == body => return key,
                None if !self.reserved.contains(&key) => break,
                _ => {
                    key = format!("{}{}", name, suffix);
                    suffix += 1;
                }
            }
        }
        self.define(key.clone(), body);
        key
    }

    fn define(&mut self, name: String, body: String) {
        self.index.insert(name.clone(), self.rules.len());
        self.rules.push((name, body));
    }

    fn reserve(&mut self, name: &str) -> String {
        let mut key = name.to_string();
        let mut suffix = 0;
        while self.index.contains_key(&key) || self.reserved.contains(&key) {
            key = format!("{}{}", name, suffix);
            suffix += 1;
        }
        self.reserved.insert(key.clone());
        key
    }

    fn primitive(&mut self, name: &str) -> Result<String> {
        if self.index.contains_key(name) {
            return Ok(name.to_string());
        }
        let (_, body, deps) = PRIMITIVES
            .iter()
            .find(|(n, _, _)| *n == name)
            .ok_or_else(|| ModelError::GrammarError(format!("Unknown primitive rule: {}", name)))?;
        self.define(name.to_string(), body.to_string());
        for dep in deps.iter() {
            self.primitive(dep)?;
        }
        Ok(name.to_string())
    }

    fn visit(&mut self, schema: &Value, name: &str) -> Result<String> {
        let schema = match schema {
            Value::Bool(true) => return self.alias(name, "value"),
            Value::Bool(false) => {
                return Err(ModelError::GrammarError("Schema `false` matches nothing".to_string()))
            }
            Value::Object(map) => map,
            other => {
                return Err(ModelError::GrammarError(format!("Unsupported schema node: {}", other)))
            }
        };

        if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
            return self.visit_ref(reference, name);
        }

        if let Some(value) = schema.get("const") {
            self.primitive("space")?;
            return Ok(self.add_rule(name, format!("{} space", json_literal(value)?)));
        }

        if let Some(values) = schema.get("enum").and_then(Value::as_array) {
            self.primitive("space")?;
            let alternatives = values.iter().map(json_literal).collect::<Result<Vec<_>>>()?;
            return Ok(self.add_rule(name, format!("({}) space", alternatives.join(" | "))));
        }

        for key in ["oneOf", "anyOf"] {
            if let Some(options) = schema.get(key).and_then(Value::as_array) {
                return self.visit_alternatives(options, name);
            }
        }

        match schema.get("type") {
            Some(Value::String(ty)) => self.visit_typed(schema, ty, name),
            Some(Value::Array(types)) => {
                let options: Vec<Value> = types
                    .iter()
                    .map(|t| {
                        let mut sub = schema.clone();
                        sub.insert("type".to_string(), t.clone());
                        Value::Object(sub)
                    })
                    .collect();
                self.visit_alternatives(&options, name)
            }
            Some(other) => Err(ModelError::GrammarError(format!("Invalid \"type\": {}", other))),
            None if schema.contains_key("properties") => self.visit_typed(schema, "object", name),
            None if schema.contains_key("items") => self.visit_typed(schema, "array", name),
            None => self.alias(name, "value"),
        }
    }

    fn visit_typed(
        &mut self,
        schema: &serde_json::Map<String, Value>,
        ty: &str,
        name: &str,
    ) -> Result<String> {
        match ty {
            "object" => self.visit_object(schema, name),
            "array" => self.visit_array(schema, name),
            "string" => {
                let min = schema.get("minLength").and_then(Value::as_u64);
                let max = schema.get("maxLength").and_then(Value::as_u64);
                if min.is_none() && max.is_none() {
                    return self.alias(name, "string");
                }
                self.primitive("char")?;
                self.primitive("space")?;
                let repeat = match (min.unwrap_or(0), max) {
                    (min, Some(max)) => format!("char{{{},{}}}", min, max),
                    (min, None) => format!("char{{{},}}", min),
                };
                Ok(self.add_rule(name, format!(r#""\"" {} "\"" space"#, repeat)))
            }
            "number" | "integer" | "boolean" | "null" => self.alias(name, ty),
            other => Err(ModelError::GrammarError(format!("Unsupported type \"{}\"", other))),
        }
    }

    fn visit_object(&mut self, schema: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        let properties = match schema.get("properties").and_then(Value::as_object) {
            Some(p) if !p.is_empty() => p,
            _ => return self.alias(name, "object"),
        };
        let required: HashSet<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        self.primitive("space")?;
        let mut required_kv = Vec::new();
        let mut optional_kv = Vec::new();
        for (prop, prop_schema) in properties {
            let prop_rule = self.visit(prop_schema, &format!("{}-{}", name, sanitize(prop)))?;
            let kv = format!(
                "{} space \":\" space {}",
                json_literal(&Value::String(prop.clone()))?,
                prop_rule
            );
            let kv_rule = self.add_rule(&format!("kv-{}-{}", name, sanitize(prop)), kv);
            if required.contains(prop.as_str()) {
                required_kv.push(kv_rule);
            } else {
                optional_kv.push(kv_rule);
            }
        }

        let mut body = String::from("\"{\" space ");
        if !required_kv.is_empty() {
            body.push_str(&required_kv.join(" \",\" space "));
            for kv in &optional_kv {
                body.push_str(&format!(" ( \",\" space {} )?", kv));
            }
        } else {
            // Any ordered subset of the optional properties
            let alternatives: Vec<String> = (0..optional_kv.len())
                .map(|i| {
                    let mut alt = optional_kv[i].clone();
                    for kv in &optional_kv[i + 1..] {
                        alt.push_str(&format!(" ( \",\" space {} )?", kv));
                    }
                    alt
                })
                .collect();
            body.push_str(&format!("( {} )?", alternatives.join(" | ")));
        }
        body.push_str(" \"}\" space");
        Ok(self.add_rule(name, body))
    }

    fn visit_array(&mut self, schema: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        let item_rule = match schema.get("items") {
            Some(items) => self.visit(items, &format!("{}-item", name))?,
            None => self.primitive("value")?,
        };
        self.primitive("space")?;
        let min = schema.get("minItems").and_then(Value::as_u64).unwrap_or(0);
        let body = if min == 0 {
            format!(
                "\"[\" space ( {item} ( \",\" space {item} )* )? \"]\" space",
                item = item_rule
            )
        } else {
            format!(
                "\"[\" space {item} ( \",\" space {item} ){{{rest},}} \"]\" space",
                item = item_rule,
                rest = min - 1
            )
        };
        Ok(self.add_rule(name, body))
    }

    fn visit_alternatives(&mut self, options: &[Value], name: &str) -> Result<String> {
        if options.is_empty() {
            return Err(ModelError::GrammarError(format!("Empty alternatives for {}", name)));
        }
        let rules = options
            .iter()
            .enumerate()
            .map(|(i, option)| self.visit(option, &format!("{}-{}", name, i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.add_rule(name, rules.join(" | ")))
    }

    fn visit_ref(&mut self, reference: &str, name: &str) -> Result<String> {
        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| ModelError::GrammarError(format!("Only local $ref is supported: {}", reference)))?;
        let target = self
            .root_schema
            .pointer(pointer)
            .ok_or_else(|| ModelError::GrammarError(format!("Unresolved $ref: {}", reference)))?;

        if let Some(rule) = self.refs.get(pointer).cloned() {
            return self.alias(name, &rule);
        }
        // Recursive references point at the reserved name while the target
        // is still being visited
        let rule = self.reserve(&format!("ref{}", sanitize(pointer)));
        self.refs.insert(pointer.to_string(), rule.clone());
        let resolved = self.visit(target, &rule)?;
        self.reserved.remove(&rule);
        self.define(rule.clone(), resolved);
        self.alias(name, &rule)
    }

    fn alias(&mut self, name: &str, target: &str) -> Result<String> {
        if PRIMITIVES.iter().any(|(n, _, _)| *n == target) {
            self.primitive(target)?;
        }
        if name == target {
            return Ok(name.to_string());
        }
        Ok(self.add_rule(name, target.to_string()))
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let root = self.rules.iter().find(|(n, _)| n == "root");
        for (rule, body) in root.into_iter().chain(self.rules.iter().filter(|(n, _)| n != "root")) {
            out.push_str(&format!("{} ::= {}\n", rule, body));
        }
        out
    }
}

/// GBNF literal matching the JSON serialization of `value`
fn json_literal(value: &Value) -> Result<String> {
    let json = serde_json::to_string(value)
        .map_err(|e| ModelError::GrammarError(format!("Cannot encode {} as a literal: {}", value, e)))?;
    Ok(gbnf_literal(&json))
}

/// Quote text as a GBNF string literal
pub fn gbnf_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(schema: Value) -> String {
        JsonSchemaCompiler.compile(&schema).unwrap()
    }

    #[test]
    fn test_root_rule_comes_first() {
        let grammar = compile(json!({"type": "integer"}));
        assert!(grammar.starts_with("root ::= integer\n"));
        assert!(grammar.contains("space ::="));
    }

    #[test]
    fn test_enum_literals_are_json_encoded() {
        let grammar = compile(json!({"enum": ["yes", "no", 3]}));
        assert!(grammar.contains(r#"root ::= ("\"yes\"" | "\"no\"" | "3") space"#));
    }

    #[test]
    fn test_object_required_and_optional() {
        let grammar = compile(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            },
            "required": ["name"]
        }));
        assert!(grammar.contains(r#"kv-root-name ::= "\"name\"" space ":" space root-name"#));
        assert!(grammar.contains(r#"root ::= "{" space kv-root-name ( "," space kv-root-age )? "}" space"#));
    }

    fn rules(grammar: &str) -> HashMap<&str, &str> {
        let mut rules = HashMap::new();
        for line in grammar.lines() {
            let (name, body) = line.split_once(" ::= ").unwrap();
            assert!(rules.insert(name, body).is_none(), "rule {} defined twice", name);
        }
        rules
    }

    fn is_primitive(name: &str) -> bool {
        PRIMITIVES.iter().any(|(p, _, _)| *p == name)
    }

    /// Non-primitive rules referenced from `body`, in order
    fn references<'a>(rules: &HashMap<&'a str, &'a str>, body: &str) -> Vec<&'a str> {
        body.split_whitespace()
            .filter_map(|word| rules.get_key_value(word).map(|(k, _)| *k))
            .filter(|name| !is_primitive(name))
            .collect()
    }

    /// Follow alias rules down to the body that does the matching
    fn resolve<'a>(rules: &HashMap<&'a str, &'a str>, mut name: &'a str) -> &'a str {
        loop {
            let body = rules[name];
            match rules.get_key_value(body) {
                Some((&next, _)) if !is_primitive(next) => name = next,
                _ => return body,
            }
        }
    }

    /// Key literal and value rule of every field of an object rule
    fn object_fields<'a>(rules: &HashMap<&'a str, &'a str>, object: &str) -> Vec<(String, &'a str)> {
        references(rules, rules[object])
            .into_iter()
            .map(|kv| {
                let body = rules[kv];
                let key = body.split(" space ").next().unwrap().to_string();
                (key, *references(rules, body).last().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_property_named_kv_keeps_its_own_rule() {
        let grammar = compile(json!({
            "properties": {
                "x": {"properties": {"kv": {"type": "integer"}}, "required": ["kv"]}
            },
            "required": ["x"]
        }));
        let rules = rules(&grammar);

        let outer = object_fields(&rules, "root");
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].0, r#""\"x\"""#);
        let x_rule = outer[0].1;
        assert!(rules[x_rule].starts_with(r#""{" space kv-"#), "x is not an object: {}", rules[x_rule]);

        let inner = object_fields(&rules, x_rule);
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].0, r#""\"kv\"""#);
        assert_eq!(resolve(&rules, inner[0].1), "integer");
    }

    #[test]
    fn test_colliding_property_names_stay_distinct() {
        let grammar = compile(json!({
            "type": "object",
            "properties": {
                "a b": {"type": "string"},
                "a-b": {"type": "integer"}
            },
            "required": ["a b", "a-b"]
        }));
        let rules = rules(&grammar);

        let kvs = references(&rules, rules["root"]);
        assert_eq!(kvs.len(), 2);
        assert_ne!(kvs[0], kvs[1]);

        let fields: Vec<(String, &str)> = object_fields(&rules, "root")
            .into_iter()
            .map(|(key, value)| (key, resolve(&rules, value)))
            .collect();
        assert!(fields.contains(&(r#""\"a b\"""#.to_string(), "string")), "{:?}", fields);
        assert!(fields.contains(&(r#""\"a-b\"""#.to_string(), "integer")), "{:?}", fields);
    }

    #[test]
    fn test_colliding_ref_targets_stay_distinct() {
        let grammar = compile(json!({
            "$defs": {
                "a b": {"type": "integer"},
                "a-b": {"type": "boolean"}
            },
            "properties": {
                "p": {"$ref": "#/$defs/a b"},
                "q": {"$ref": "#/$defs/a-b"}
            },
            "required": ["p", "q"]
        }));
        let rules = rules(&grammar);

        let fields: Vec<(String, &str)> = object_fields(&rules, "root")
            .into_iter()
            .map(|(key, value)| (key, resolve(&rules, value)))
            .collect();
        assert_eq!(
            fields,
            vec![
                (r#""\"p\"""#.to_string(), "integer"),
                (r#""\"q\"""#.to_string(), "boolean"),
            ]
        );
    }

    #[test]
    fn test_local_ref_and_recursion() {
        let grammar = compile(json!({
            "$defs": {
                "node": {
                    "type": "object",
                    "properties": {"next": {"$ref": "#/$defs/node"}}
                }
            },
            "$ref": "#/$defs/node"
        }));
        assert!(grammar.contains("ref--defs-node ::="));
        assert!(grammar.starts_with("root ::= ref--defs-node"));
    }

    #[test]
    fn test_array_min_items() {
        let grammar = compile(json!({"type": "array", "items": {"type": "boolean"}, "minItems": 2}));
        assert!(grammar.contains(r#"( "," space root-item ){1,}"#));
    }

    #[test]
    fn test_unsupported_type_is_error() {
        assert!(matches!(
            JsonSchemaCompiler.compile(&json!({"type": "tuple"})),
            Err(ModelError::GrammarError(_))
        ));
    }
}
