//! Token-stream query compiler.
//!
//! Translates the whitespace-tokenized prefix grammar (`LINK_TEMPLATE`,
//! `LINK`, `NODE`, `VARIABLE`, `ATOM`, `AND`, `OR`) into a query element
//! graph ready to be rooted at a [`crate::element::Sink`].

use std::sync::Arc;

use atomspace::{Handle, LinkSchema, PatternTarget};

use crate::element::{
    AndOperator, LinkTemplateSource, OrOperator, QueryElement, UniqueAssignmentFilter,
};
use crate::error::QueryEngineError;
use crate::{Result, MAX_OPERATOR_CLAUSES};

pub const LINK_TEMPLATE: &str = "LINK_TEMPLATE";
pub const LINK: &str = "LINK";
pub const NODE: &str = "NODE";
pub const VARIABLE: &str = "VARIABLE";
pub const ATOM: &str = "ATOM";
pub const AND: &str = "AND";
pub const OR: &str = "OR";

/// Flags the compiler honors while building the graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileFlags {
    /// Wrap every operator in a [`UniqueAssignmentFilter`].
    pub unique_assignment: bool,
    /// Sources drop matches without strictly positive importance.
    pub positive_importance: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Node { node_type: String, name: String },
    Variable(String),
    Atom(Handle),
    Link { link_type: String, targets: Vec<Term>, template: bool },
    And(Vec<Term>),
    Or(Vec<Term>),
}

/// Compiles the token stream into the graph's root element.
///
/// `context` is the attention context importance lookups run under; an
/// empty context skips them.
pub fn compile_query(
    tokens: &[String],
    context: &str,
    flags: CompileFlags,
) -> Result<Arc<dyn QueryElement>> {
    if tokens.is_empty() {
        return Err(QueryEngineError::MalformedQuery("empty query".to_string()));
    }
    let mut cursor = 0;
    let term = parse_term(tokens, &mut cursor)?;
    if cursor != tokens.len() {
        return Err(QueryEngineError::MalformedQuery(format!(
            "trailing tokens after position {}",
            cursor
        )));
    }
    build_element(&term, context, flags)
}

fn next_token<'a>(tokens: &'a [String], cursor: &mut usize) -> Result<&'a str> {
    let token = tokens.get(*cursor).ok_or_else(|| {
        QueryEngineError::MalformedQuery("unexpected end of query tokens".to_string())
    })?;
    *cursor += 1;
    Ok(token)
}

fn parse_arity(tokens: &[String], cursor: &mut usize, operator: &str) -> Result<usize> {
    let raw = next_token(tokens, cursor)?;
    raw.parse().map_err(|_| {
        QueryEngineError::MalformedQuery(format!("invalid {} arity: {:?}", operator, raw))
    })
}

fn parse_term(tokens: &[String], cursor: &mut usize) -> Result<Term> {
    let tag = next_token(tokens, cursor)?.to_string();
    match tag.as_str() {
        NODE => Ok(Term::Node {
            node_type: next_token(tokens, cursor)?.to_string(),
            name: next_token(tokens, cursor)?.to_string(),
        }),
        VARIABLE => Ok(Term::Variable(next_token(tokens, cursor)?.to_string())),
        ATOM => {
            let raw = next_token(tokens, cursor)?;
            let handle = raw
                .parse::<Handle>()
                .map_err(|e| QueryEngineError::MalformedQuery(e.to_string()))?;
            Ok(Term::Atom(handle))
        }
        LINK | LINK_TEMPLATE => {
            let link_type = next_token(tokens, cursor)?.to_string();
            let arity = parse_arity(tokens, cursor, &tag)?;
            if arity == 0 {
                return Err(QueryEngineError::MalformedQuery(format!(
                    "{} {} with zero arity",
                    tag, link_type
                )));
            }
            let mut targets = Vec::with_capacity(arity);
            for _ in 0..arity {
                targets.push(parse_term(tokens, cursor)?);
            }
            Ok(Term::Link {
                link_type,
                targets,
                template: tag == LINK_TEMPLATE,
            })
        }
        AND | OR => {
            let arity = parse_arity(tokens, cursor, &tag)?;
            if arity == 0 || arity > MAX_OPERATOR_CLAUSES {
                return Err(QueryEngineError::MalformedQuery(format!(
                    "{} arity {} outside 1..={}",
                    tag, arity, MAX_OPERATOR_CLAUSES
                )));
            }
            let mut clauses = Vec::with_capacity(arity);
            for _ in 0..arity {
                clauses.push(parse_term(tokens, cursor)?);
            }
            if tag == AND {
                Ok(Term::And(clauses))
            } else {
                Ok(Term::Or(clauses))
            }
        }
        other => Err(QueryEngineError::MalformedQuery(format!(
            "unexpected query token: {:?}",
            other
        ))),
    }
}

fn build_element(
    term: &Term,
    context: &str,
    flags: CompileFlags,
) -> Result<Arc<dyn QueryElement>> {
    match term {
        Term::Link { template: true, .. } => {
            let schema = to_schema(term)?;
            let source = if flags.positive_importance {
                LinkTemplateSource::with_positive_importance(schema, context)
            } else {
                LinkTemplateSource::new(schema, context)
            };
            Ok(source)
        }
        Term::And(clauses) => {
            let built = build_clauses(clauses, context, flags)?;
            let operator = AndOperator::new(built)?;
            Ok(wrap_unique(operator, flags))
        }
        Term::Or(clauses) => {
            let built = build_clauses(clauses, context, flags)?;
            let operator = OrOperator::new(built)?;
            Ok(wrap_unique(operator, flags))
        }
        other => Err(QueryEngineError::MalformedQuery(format!(
            "query root or operator clause must be a LINK_TEMPLATE, AND or OR, got {}",
            term_tag(other)
        ))),
    }
}

fn build_clauses(
    clauses: &[Term],
    context: &str,
    flags: CompileFlags,
) -> Result<Vec<Arc<dyn QueryElement>>> {
    clauses
        .iter()
        .map(|clause| build_element(clause, context, flags))
        .collect()
}

fn wrap_unique(operator: Arc<dyn QueryElement>, flags: CompileFlags) -> Arc<dyn QueryElement> {
    if flags.unique_assignment {
        UniqueAssignmentFilter::new(operator)
    } else {
        operator
    }
}

fn term_tag(term: &Term) -> &'static str {
    match term {
        Term::Node { .. } => NODE,
        Term::Variable(_) => VARIABLE,
        Term::Atom(_) => ATOM,
        Term::Link { template: true, .. } => LINK_TEMPLATE,
        Term::Link { template: false, .. } => LINK,
        Term::And(_) => AND,
        Term::Or(_) => OR,
    }
}

fn to_schema(term: &Term) -> Result<LinkSchema> {
    let (link_type, targets) = match term {
        Term::Link {
            link_type, targets, ..
        } => (link_type, targets),
        other => {
            return Err(QueryEngineError::MalformedQuery(format!(
                "expected a link pattern, got {}",
                term_tag(other)
            )))
        }
    };
    let mut pattern_targets = Vec::with_capacity(targets.len());
    for target in targets {
        pattern_targets.push(to_pattern_target(target)?);
    }
    Ok(LinkSchema::new(link_type.clone(), pattern_targets))
}

fn to_pattern_target(term: &Term) -> Result<PatternTarget> {
    match term {
        Term::Node { node_type, name } => Ok(PatternTarget::Node {
            node_type: node_type.clone(),
            name: name.clone(),
        }),
        Term::Variable(name) => Ok(PatternTarget::Variable(name.clone())),
        Term::Atom(handle) => Ok(PatternTarget::Handle(handle.clone())),
        Term::Link { template: true, .. } => Ok(PatternTarget::SubSchema(to_schema(term)?)),
        Term::Link { template: false, .. } => {
            let schema = to_schema(term)?;
            match schema.grounded_handle() {
                Some(handle) => Ok(PatternTarget::Handle(handle)),
                None => Err(QueryEngineError::MalformedQuery(
                    "LINK targets must be fully grounded; use LINK_TEMPLATE for patterns"
                        .to_string(),
                )),
            }
        }
        operator => Err(QueryEngineError::MalformedQuery(format!(
            "{} cannot appear inside a link pattern",
            term_tag(operator)
        ))),
    }
}
