use std::fmt;

use serde::{Deserialize, Serialize};

/// Pseudo-field for terms that may match in any field.
pub const ANY_FIELD: &str = "_ANYFIELD_";
/// Pseudo-field for terms with no field at all.
pub const NO_FIELD: &str = "_NOFIELD_";
/// Field holding the record datatype; never resolved against the shard index.
pub const DATATYPE_FIELD: &str = "EVENT_DATATYPE";
/// Assignment name used to pin a query to explicit shards or days.
pub const SHARD_DAY_HINT: &str = "SHARDS_AND_DAYS";

/// Annotation carried by an `And` node that changes how it resolves
/// against the index without changing what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    BoundedRange,
    Delayed,
    EvaluationOnly,
    ExceededValue,
    ExceededOr,
    ExceededTerm,
    Dropped,
    IndexHole,
}

impl Marker {
    pub fn label(&self) -> &'static str {
        match self {
            Marker::BoundedRange => "_Bounded_",
            Marker::Delayed => "_Delayed_",
            Marker::EvaluationOnly => "_Eval_",
            Marker::ExceededValue => "_Value_",
            Marker::ExceededOr => "_List_",
            Marker::ExceededTerm => "_Term_",
            Marker::Dropped => "_Drop_",
            Marker::IndexHole => "_Hole_",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Ne => "!=",
        }
    }
}

/// Query tree as handed over by the query parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Node {
    Equality {
        field: String,
        literal: Option<String>,
    },
    Range {
        field: String,
        lower: String,
        upper: String,
        lower_inclusive: bool,
        upper_inclusive: bool,
    },
    Compare {
        field: String,
        op: CompareOp,
        literal: Option<String>,
    },
    Regex {
        field: String,
        pattern: Option<String>,
    },
    Function {
        name: String,
        args: Vec<String>,
    },
    Assignment {
        name: String,
        value: String,
    },
    And {
        children: Vec<Node>,
        marker: Option<Marker>,
    },
    Or {
        children: Vec<Node>,
    },
    Not(Box<Node>),
    True,
    False,
}

impl Node {
    pub fn equals(field: impl Into<String>, literal: impl Into<String>) -> Self {
        Node::Equality {
            field: field.into(),
            literal: Some(literal.into()),
        }
    }

    pub fn and(children: Vec<Node>) -> Self {
        Node::And {
            children,
            marker: None,
        }
    }

    pub fn or(children: Vec<Node>) -> Self {
        Node::Or { children }
    }

    pub fn marked(marker: Marker, source: Node) -> Self {
        Node::And {
            children: vec![source],
            marker: Some(marker),
        }
    }

    /// Inclusive `lower <= field <= upper`.
    pub fn range(field: impl Into<String>, lower: impl Into<String>, upper: impl Into<String>) -> Self {
        Node::Range {
            field: field.into(),
            lower: lower.into(),
            upper: upper.into(),
            lower_inclusive: true,
            upper_inclusive: true,
        }
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, literal: impl Into<String>) -> Self {
        Node::Compare {
            field: field.into(),
            op,
            literal: Some(literal.into()),
        }
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Node::Regex {
            field: field.into(),
            pattern: Some(pattern.into()),
        }
    }

    pub fn not(child: Node) -> Self {
        Node::Not(Box::new(child))
    }

    pub fn hint(value: impl Into<String>) -> Self {
        Node::Assignment {
            name: SHARD_DAY_HINT.to_string(),
            value: value.into(),
        }
    }

    pub fn marker(&self) -> Option<Marker> {
        match self {
            Node::And { marker, .. } => *marker,
            _ => None,
        }
    }

    pub fn is_marked(&self) -> bool {
        self.marker().is_some()
    }

    /// Field of a leaf term, if it has one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Node::Equality { field, .. }
            | Node::Range { field, .. }
            | Node::Compare { field, .. }
            | Node::Regex { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Every field referenced anywhere below this node.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Node::And { children, .. } | Node::Or { children } => stack.extend(children),
                Node::Not(child) => stack.push(child),
                other => fields.extend(other.field()),
            }
        }
        fields.sort_unstable();
        fields.dedup();
        fields
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::And { children, .. } | Node::Or { children } => children,
            Node::Not(child) => std::slice::from_ref(child.as_ref()),
            _ => &[],
        }
    }
}

/// True for the any-field and no-field pseudo fields.
pub fn is_unfielded(field: &str) -> bool {
    field == ANY_FIELD || field == NO_FIELD
}

struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("'")?;
        for c in self.0.chars() {
            if c == '\'' || c == '\\' {
                f.write_str("\\")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str("'")
    }
}

fn join(f: &mut fmt::Formatter<'_>, children: &[Node], op: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, " {op} ")?;
        }
        write!(f, "{child}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Equality { field, literal } => match literal {
                Some(literal) => write!(f, "{field} == {}", Quoted(literal)),
                None => write!(f, "{field} == null"),
            },
            Node::Range {
                field,
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
            } => {
                let low = if *lower_inclusive { ">=" } else { ">" };
                let high = if *upper_inclusive { "<=" } else { "<" };
                write!(
                    f,
                    "({field} {low} {} && {field} {high} {})",
                    Quoted(lower),
                    Quoted(upper)
                )
            }
            Node::Compare { field, op, literal } => match literal {
                Some(literal) => write!(f, "{field} {} {}", op.symbol(), Quoted(literal)),
                None => write!(f, "{field} {} null", op.symbol()),
            },
            Node::Regex { field, pattern } => match pattern {
                Some(pattern) => write!(f, "{field} =~ {}", Quoted(pattern)),
                None => write!(f, "{field} =~ null"),
            },
            Node::Function { name, args } => write!(f, "{name}({})", args.join(", ")),
            Node::Assignment { name, value } => write!(f, "({name} = {})", Quoted(value)),
            Node::And {
                children,
                marker: Some(marker),
            } => {
                write!(f, "(({} = true) && ", marker.label())?;
                match children.as_slice() {
                    [single @ (Node::And { .. } | Node::Or { .. } | Node::Range { .. })] => {
                        write!(f, "{single}")?
                    }
                    [single] => write!(f, "({single})")?,
                    many => join(f, many, "&&")?,
                }
                f.write_str(")")
            }
            Node::And {
                children,
                marker: None,
            } => join(f, children, "&&"),
            Node::Or { children } => join(f, children, "||"),
            Node::Not(child) => match child.as_ref() {
                Node::And { .. } | Node::Or { .. } => write!(f, "!{child}"),
                other => write!(f, "!({other})"),
            },
            Node::True => f.write_str("true"),
            Node::False => f.write_str("false"),
        }
    }
}
