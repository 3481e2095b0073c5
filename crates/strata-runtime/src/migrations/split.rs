/// Split a SQL script into statements on top-level semicolons.
///
/// Semicolons inside dollar-quoted bodies (`$$ ... $$`, `$tag$ ... $tag$`),
/// single-quoted literals, double-quoted identifiers, `--` line comments and
/// `/* */` block comments do not split. Chunks that contain only whitespace
/// and comments are dropped.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut dollar_tag: Option<String> = None;
    let mut in_literal = false;
    let mut in_quoted_ident = false;
    let mut in_comment = false;
    let mut in_block_comment = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);

        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        if in_block_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                current.push('/');
                chars.next();
                in_block_comment = false;
            }
            continue;
        }
        // A doubled quote is an escape; it closes and reopens in one step.
        if in_literal {
            if c == '\'' {
                in_literal = false;
            }
            continue;
        }
        if in_quoted_ident {
            if c == '"' {
                in_quoted_ident = false;
            }
            continue;
        }

        match c {
            '-' if dollar_tag.is_none() && chars.peek() == Some(&'-') => in_comment = true,
            '/' if dollar_tag.is_none() && chars.peek() == Some(&'*') => {
                current.push('*');
                chars.next();
                in_block_comment = true;
            }
            '\'' if dollar_tag.is_none() => in_literal = true,
            '"' if dollar_tag.is_none() => in_quoted_ident = true,
            '$' => {
                let mut tag = String::from("$");
                while let Some(&next) = chars.peek() {
                    if next == '$' {
                        tag.push(next);
                        current.push(next);
                        chars.next();
                        break;
                    } else if next.is_alphanumeric() || next == '_' {
                        tag.push(next);
                        current.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }

                if tag.len() >= 2 && tag.ends_with('$') {
                    match &dollar_tag {
                        Some(open) if *open == tag => dollar_tag = None,
                        Some(_) => {}
                        None => dollar_tag = Some(tag),
                    }
                }
            }
            ';' if dollar_tag.is_none() => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => {}
        }
    }

    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, chunk: &str) {
    let stmt = chunk.trim().trim_end_matches(';').trim();
    if !strip_comments(stmt).trim().is_empty() {
        statements.push(stmt.to_string());
    }
}

/// Text outside `--` and `/* */` comments. Only used to detect
/// comment-only chunks, so quoting is ignored.
fn strip_comments(stmt: &str) -> String {
    let mut out = String::new();
    let mut rest = stmt;
    loop {
        let line = rest.find("--");
        let block = rest.find("/*");
        match (line, block) {
            (Some(l), b) if b.map_or(true, |b| l < b) => {
                out.push_str(&rest[..l]);
                match rest[l..].find('\n') {
                    Some(end) => rest = &rest[l + end..],
                    None => return out,
                }
            }
            (_, Some(b)) => {
                out.push_str(&rest[..b]);
                match rest[b + 2..].find("*/") {
                    Some(end) => rest = &rest[b + 2 + end + 2..],
                    None => return out,
                }
            }
            (None, None) => {
                out.push_str(rest);
                return out;
            }
            // Covered by the first arm's guard (`b` is `None`).
            (Some(_), None) => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_sql_statements("SELECT 1; SELECT 2; SELECT 3;");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn test_split_with_dollar_quoted_function() {
        let sql = r#"
CREATE FUNCTION test() RETURNS void AS $$
BEGIN
    SELECT 1;
    SELECT 2;
END;
$$ LANGUAGE plpgsql;

SELECT 3;
"#;
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("CREATE FUNCTION"));
        assert!(stmts[0].contains("$$ LANGUAGE plpgsql"));
        assert!(stmts[1].contains("SELECT 3"));
    }

    #[test]
    fn test_split_tagged_dollar_quote() {
        let sql = "DO $body$ BEGIN PERFORM 1; END $body$; SELECT 2";
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "DO $body$ BEGIN PERFORM 1; END $body$");
    }

    #[test]
    fn test_semicolons_in_literals_and_comments() {
        let sql = r#"
-- seed; statuses
INSERT INTO "EventStatuses" ("Id", "Name") VALUES (1, 'Active; open');
UPDATE "Events" SET "WeightUnitId" = 1; -- trailing; note
"#;
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("'Active; open')"));
        assert!(stmts[1].starts_with("UPDATE"));
    }

    #[test]
    fn test_block_comments_do_not_split() {
        let stmts = split_sql_statements("/* seed; statuses */ SELECT 1; SELECT 2;");
        assert_eq!(stmts, vec!["/* seed; statuses */ SELECT 1", "SELECT 2"]);

        let stmts = split_sql_statements("SELECT 1; /* only; a comment */");
        assert_eq!(stmts, vec!["SELECT 1"]);
    }

    #[test]
    fn test_quoted_identifiers_with_apostrophes() {
        let sql = r#"ALTER TABLE "Users" RENAME COLUMN "Owner's" TO "Owner"; SELECT 2;"#;
        let stmts = split_sql_statements(sql);
        assert_eq!(
            stmts,
            vec![
                r#"ALTER TABLE "Users" RENAME COLUMN "Owner's" TO "Owner""#,
                "SELECT 2"
            ]
        );

        let stmts = split_sql_statements(r#"SELECT 1 AS "a"";b"; SELECT 'it''s; fine'"#);
        assert_eq!(stmts, vec![r#"SELECT 1 AS "a"";b""#, "SELECT 'it''s; fine'"]);
    }

    #[test]
    fn test_comment_only_chunks_are_dropped() {
        let stmts = split_sql_statements("-- nothing here\n\n;  ;");
        assert!(stmts.is_empty());
    }
}
