//! Statement rendering
//!
//! Turns a plan statement plus its resolved parameter values into the SQL
//! sent to the driver. A chunkable template whose list parameter would
//! exceed the connection's bind-value ceiling is split into several
//! statements, each carrying one slice of the list.

use quarry_core::{CanonicalError, EngineResult, Fragment, PlaceholderFormat, SqlQuery, Statement, Value};

/// Renders `statement` with `params` (one value per declared parameter).
///
/// Returns one statement, or several when a list parameter was chunked.
///
/// # Errors
///
/// `PlanError` when the parameter count does not match the fragments, a
/// tuple parameter is not a list, or the statement needs more bind values
/// than `max_bind_values` and cannot be chunked.
pub fn render(
    statement: &Statement,
    params: Vec<Value>,
    max_bind_values: usize,
) -> EngineResult<Vec<SqlQuery>> {
    match statement {
        Statement::Raw { sql, .. } => {
            if params.len() > max_bind_values {
                return Err(too_many_binds(params.len(), max_bind_values));
            }
            Ok(vec![SqlQuery::new(sql.clone(), params)])
        }
        Statement::Template {
            fragments,
            placeholder,
            chunkable,
            ..
        } => render_template(fragments, params, placeholder, *chunkable, max_bind_values),
    }
}

fn render_template(
    fragments: &[Fragment],
    params: Vec<Value>,
    placeholder: &PlaceholderFormat,
    chunkable: bool,
    max_bind_values: usize,
) -> EngineResult<Vec<SqlQuery>> {
    let slots: Vec<&Fragment> = fragments
        .iter()
        .filter(|fragment| !matches!(fragment, Fragment::Text { .. }))
        .collect();
    if slots.len() != params.len() {
        return Err(CanonicalError::plan(format!(
            "template has {} placeholders but {} parameters",
            slots.len(),
            params.len()
        )));
    }

    let mut required = 0;
    let mut largest: Option<(usize, usize)> = None;
    for (index, (slot, value)) in slots.iter().zip(&params).enumerate() {
        match (slot, value) {
            (Fragment::ParamTuple, Value::List(items)) => {
                required += items.len();
                if largest.map_or(true, |(_, len)| items.len() > len) {
                    largest = Some((index, items.len()));
                }
            }
            (Fragment::ParamTuple, other) => {
                return Err(CanonicalError::plan(format!(
                    "tuple parameter {} must be a list, got {}",
                    index + 1,
                    other.type_name()
                )))
            }
            _ => required += 1,
        }
    }

    if required <= max_bind_values {
        return Ok(vec![assemble(fragments, &params, placeholder)]);
    }
    let Some((list_index, list_len)) = largest.filter(|_| chunkable) else {
        return Err(too_many_binds(required, max_bind_values));
    };
    let fixed = required - list_len;
    if fixed >= max_bind_values {
        return Err(too_many_binds(required, max_bind_values));
    }
    let chunk_size = max_bind_values - fixed;

    let Value::List(items) = &params[list_index] else {
        return Err(CanonicalError::plan("chunked parameter is not a list"));
    };
    Ok(items
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk_params = params.clone();
            chunk_params[list_index] = Value::List(chunk.to_vec());
            assemble(fragments, &chunk_params, placeholder)
        })
        .collect())
}

/// Concatenates fragments, numbering placeholders as they are emitted.
fn assemble(fragments: &[Fragment], params: &[Value], placeholder: &PlaceholderFormat) -> SqlQuery {
    let mut sql = String::new();
    let mut args = Vec::new();
    let mut params = params.iter();

    for fragment in fragments {
        match fragment {
            Fragment::Text { chunk } => sql.push_str(chunk),
            Fragment::Param => {
                let value = params.next().cloned().unwrap_or(Value::Null);
                args.push(value);
                push_placeholder(&mut sql, placeholder, args.len());
            }
            Fragment::ParamTuple => {
                let items: &[Value] = match params.next() {
                    Some(Value::List(items)) => items.as_slice(),
                    _ => &[],
                };
                if items.is_empty() {
                    sql.push_str("NULL");
                    continue;
                }
                sql.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        sql.push(',');
                    }
                    args.push(item.clone());
                    push_placeholder(&mut sql, placeholder, args.len());
                }
                sql.push(')');
            }
        }
    }
    SqlQuery::new(sql, args)
}

fn push_placeholder(sql: &mut String, placeholder: &PlaceholderFormat, position: usize) {
    sql.push_str(&placeholder.prefix);
    if placeholder.numbered {
        sql.push_str(&position.to_string());
    }
}

fn too_many_binds(required: usize, max_bind_values: usize) -> CanonicalError {
    CanonicalError::plan(format!(
        "statement needs {required} bind values but the connection accepts at most {max_bind_values}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ErrorKind;

    fn text(chunk: &str) -> Fragment {
        Fragment::Text {
            chunk: chunk.to_string(),
        }
    }

    fn template(fragments: Vec<Fragment>, numbered: bool, chunkable: bool) -> Statement {
        Statement::Template {
            fragments,
            params: Vec::new(),
            placeholder: if numbered {
                PlaceholderFormat {
                    prefix: "$".to_string(),
                    numbered: true,
                }
            } else {
                PlaceholderFormat::default()
            },
            chunkable,
        }
    }

    fn ints(range: std::ops::Range<i64>) -> Value {
        Value::List(range.map(Value::Int).collect())
    }

    #[test]
    fn test_numbered_placeholders_follow_emission_order() {
        let statement = template(
            vec![
                text("SELECT * FROM posts WHERE author_id = "),
                Fragment::Param,
                text(" AND id IN "),
                Fragment::ParamTuple,
            ],
            true,
            false,
        );
        let rendered = render(&statement, vec![Value::Int(7), ints(1..4)], 100).unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(
            rendered[0].sql,
            "SELECT * FROM posts WHERE author_id = $1 AND id IN ($2,$3,$4)"
        );
        assert_eq!(rendered[0].args.len(), 4);
    }

    #[test]
    fn test_empty_tuple_renders_null() {
        let statement = template(vec![text("SELECT 1 WHERE id IN "), Fragment::ParamTuple], false, false);
        let rendered = render(&statement, vec![Value::List(vec![])], 10).unwrap();
        assert_eq!(rendered[0].sql, "SELECT 1 WHERE id IN NULL");
        assert!(rendered[0].args.is_empty());
    }

    #[test]
    fn test_chunkable_list_is_split_by_bind_limit() {
        let statement = template(
            vec![
                text("DELETE FROM t WHERE tenant = "),
                Fragment::Param,
                text(" AND id IN "),
                Fragment::ParamTuple,
            ],
            false,
            true,
        );
        let rendered = render(&statement, vec![Value::Int(1), ints(0..10)], 4).unwrap();
        assert_eq!(rendered.len(), 4);
        assert_eq!(rendered[0].sql, "DELETE FROM t WHERE tenant = ? AND id IN (?,?,?)");
        assert_eq!(rendered[3].sql, "DELETE FROM t WHERE tenant = ? AND id IN (?)");
        let total: usize = rendered.iter().map(|q| q.args.len() - 1).sum();
        assert_eq!(total, 10);
        assert!(rendered.iter().all(|q| q.args[0] == Value::Int(1)));
    }

    #[test]
    fn test_non_chunkable_statement_over_limit_is_plan_error() {
        let statement = template(vec![text("SELECT "), Fragment::ParamTuple], false, false);
        let err = render(&statement, vec![ints(0..5)], 4).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlanError);

        let raw = Statement::Raw {
            sql: "SELECT ?, ?".to_string(),
            params: Vec::new(),
        };
        let err = render(&raw, vec![Value::Int(1), Value::Int(2)], 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlanError);
    }

    #[test]
    fn test_tuple_parameter_must_be_list() {
        let statement = template(vec![text("SELECT "), Fragment::ParamTuple], false, false);
        let err = render(&statement, vec![Value::Int(1)], 10).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlanError);
    }
}
