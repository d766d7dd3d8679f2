//! Interactive REPL (Read-Eval-Print Loop) for crudtx.

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde_json::Value;

use super::error::{ReplError, ReplResult};
use crate::config::Config;
use crate::crud::{Crud, PageRequest, Status};
use crate::model::{ColumnDef, DataType, ModelSchema};
use crate::session::{Fault, MemorySession, Record, Session, TableName};
use crate::transaction::{ErrorPolicy, TransactionManager};

/// REPL configuration.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Prompt string.
    pub prompt: String,
    /// Show timing information.
    pub timing: bool,
    /// Max rows to display.
    pub max_rows: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "crudtx> ".into(),
            timing: false,
            max_rows: 100,
        }
    }
}

/// What the loop should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Quit,
}

/// The interactive REPL.
///
/// Scopes are opened with `open` and stack up: every command works on the
/// innermost one, and `close`/`abort` pop it.
pub struct Repl {
    session: Arc<MemorySession>,
    manager: TransactionManager,
    scopes: Vec<Crud>,
    config: ReplConfig,
    history: Vec<String>,
}

impl Repl {
    /// Create a new REPL over a fresh in-memory session.
    pub fn new(config: Config) -> Self {
        Self::with_config(config, ReplConfig::default())
    }

    pub fn with_config(config: Config, repl: ReplConfig) -> Self {
        let session = Arc::new(MemorySession::new());
        let manager = TransactionManager::for_session(session.clone(), config);
        Self {
            session,
            manager,
            scopes: Vec::new(),
            config: repl,
            history: Vec::new(),
        }
    }

    pub fn session(&self) -> &Arc<MemorySession> {
        &self.session
    }

    /// Number of scopes currently open.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Run the REPL interactively.
    pub fn run(&mut self) -> ReplResult<()> {
        self.print_banner();

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            let prompt = match self.scopes.last() {
                Some(top) => format!("{}[{}]> ", top.model(), self.scopes.len()),
                None => self.config.prompt.clone(),
            };
            print!("{}", prompt);
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                // EOF.
                println!("\nGoodbye!");
                break;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.history.push(line.to_string());

            let start = std::time::Instant::now();
            match self.execute(line) {
                Ok(Outcome::Quit) => break,
                Ok(Outcome::Continue(output)) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                    if self.config.timing {
                        println!("Time: {:.3}ms", start.elapsed().as_secs_f64() * 1000.0);
                    }
                }
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        if !self.scopes.is_empty() {
            println!("Aborting {} open scope(s).", self.scopes.len());
            self.abort_all();
        }
        Ok(())
    }

    /// Execute one line and return what it printed.
    pub fn execute(&mut self, line: &str) -> ReplResult<Outcome> {
        let line = line.trim();
        if line.starts_with('.') || line.starts_with('\\') {
            return self.handle_command(line);
        }

        let (command, rest) = split_word(line);
        let output = match command.to_lowercase().as_str() {
            "" => String::new(),
            "open" => self.open(rest)?,
            "add" => self.add(rest)?,
            "update" => self.update(rest)?,
            "delete" => self.delete(rest)?,
            "find" => self.find(rest)?,
            "count" => {
                let top = self.top()?;
                let query = top.query().filter_by(parse_optional(rest)?);
                format!("{}", query.count()?)
            }
            "commit" => {
                let top = self.top_mut()?;
                top.commit()?;
                status_line(top.status(), None)
            }
            "discard" => {
                let cleanup = self.top_mut()?.discard();
                format!("discarded ({})", cleanup)
            }
            "close" => {
                let top = self.scopes.pop().ok_or(ReplError::NoScope)?;
                let model = top.model().to_string();
                top.close()?;
                format!("closed {}", model)
            }
            "abort" => {
                let top = self.scopes.pop().ok_or(ReplError::NoScope)?;
                let model = top.model().to_string();
                top.abort()?;
                format!("aborted {}", model)
            }
            "fail" => {
                let fault = Fault::parse(rest).ok_or_else(|| {
                    ReplError::Usage(
                        "fail <begin|nested|commit|rollback|release|rollback_to|write>".into(),
                    )
                })?;
                self.session.fail_next(fault);
                format!("next {:?} will fail", fault)
            }
            other => {
                return Err(ReplError::Usage(format!(
                    "unknown command '{}', type .help for commands",
                    other
                )))
            }
        };
        Ok(Outcome::Continue(output))
    }

    fn print_banner(&self) {
        println!("╔═══════════════════════════════════════════════════╗");
        println!("║                    crudtx v0.1.0                  ║");
        println!("║       Nested transaction scopes, interactively    ║");
        println!("╠═══════════════════════════════════════════════════╣");
        println!("║  Type .help for commands                          ║");
        println!("╚═══════════════════════════════════════════════════╝");
        println!();
    }

    fn handle_command(&mut self, cmd: &str) -> ReplResult<Outcome> {
        let cmd = cmd.trim_start_matches(&['.', '\\'][..]);
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let command = parts.first().map(|s| s.to_lowercase());

        let output = match command.as_deref() {
            Some("help") | Some("h") | Some("?") => help_text(),
            Some("quit") | Some("exit") | Some("q") => return Ok(Outcome::Quit),
            Some("model") => self.declare_model(&parts[1..])?,
            Some("tables") | Some("dt") => {
                let tables = self.session.tables();
                if tables.is_empty() {
                    "No models declared.".to_string()
                } else {
                    tables
                        .iter()
                        .map(|t| format!("  {}", t))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Some("show") => {
                let name = parts
                    .get(1)
                    .ok_or_else(|| ReplError::Usage(".show <model>".into()))?;
                let table = table_name(name)?;
                let rows = self.session.committed_rows(&table)?;
                self.format_rows(&rows)
            }
            Some("schema") => {
                let name = parts
                    .get(1)
                    .ok_or_else(|| ReplError::Usage(".schema <model>".into()))?;
                let schema = self.session.schema(&table_name(name)?)?;
                describe(&schema)
            }
            Some("state") => self.state_text(),
            Some("journal") => {
                if parts.get(1) == Some(&"clear") {
                    self.session.clear_journal();
                    "journal cleared".to_string()
                } else {
                    self.session
                        .journal()
                        .iter()
                        .enumerate()
                        .map(|(i, e)| format!("  {}: {}", i + 1, e))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Some("policy") => match parts.get(1) {
                Some(value) => {
                    let policy: ErrorPolicy = value.parse().map_err(ReplError::Usage)?;
                    self.top_mut()?.error_policy(policy);
                    format!("scope error policy: {}", policy)
                }
                None => {
                    let policy = match self.scopes.last() {
                        Some(top) => top.scope().error_policy(),
                        None => self.manager.resolve_error_policy(None),
                    };
                    format!("error policy: {}", policy)
                }
            },
            Some("history") => self
                .history
                .iter()
                .enumerate()
                .map(|(i, cmd)| format!("  {}: {}", i + 1, cmd))
                .collect::<Vec<_>>()
                .join("\n"),
            Some("timing") => {
                self.config.timing = !self.config.timing;
                format!("Timing: {}", if self.config.timing { "on" } else { "off" })
            }
            Some(cmd) => {
                return Err(ReplError::Usage(format!(
                    "unknown command .{}, type .help for available commands",
                    cmd
                )))
            }
            None => String::new(),
        };
        Ok(Outcome::Continue(output))
    }

    /// `.model users email:text!* name:text age:int`
    ///
    /// `!` marks a column required, `*` unique.
    fn declare_model(&self, parts: &[&str]) -> ReplResult<String> {
        let (name, columns) = parts
            .split_first()
            .ok_or_else(|| ReplError::Usage(".model <name> <column:type[!][*]>...".into()))?;
        let mut builder = ModelSchema::builder(table_name(name)?);
        for spec in columns {
            let (column, ty) = spec
                .split_once(':')
                .ok_or_else(|| ReplError::Usage(format!("column '{}' needs a type", spec)))?;
            let required = ty.contains('!');
            let unique = ty.contains('*');
            let ty = ty.trim_end_matches(&['!', '*'][..]);
            let data_type = DataType::parse(ty)
                .ok_or_else(|| ReplError::Usage(format!("unknown type '{}'", ty)))?;
            let mut def = ColumnDef::new(column, data_type);
            if required {
                def = def.required();
            }
            if unique {
                def = def.unique();
            }
            builder = builder.column_def(def);
        }
        let schema = builder.build()?;
        let name = schema.name.clone();
        self.session.create_table(schema)?;
        Ok(format!("declared {}", name))
    }

    fn top(&self) -> ReplResult<&Crud> {
        self.scopes.last().ok_or(ReplError::NoScope)
    }

    fn top_mut(&mut self) -> ReplResult<&mut Crud> {
        self.scopes.last_mut().ok_or(ReplError::NoScope)
    }

    fn open(&mut self, rest: &str) -> ReplResult<String> {
        let (model, defaults) = split_word(rest);
        if model.is_empty() {
            return Err(ReplError::Usage("open <model> [defaults-json]".into()));
        }
        let crud = self.manager.crud_with(model, parse_optional(defaults)?)?;
        let joined = crud.scope().joined();
        self.scopes.push(crud);
        Ok(format!(
            "opened {} (depth {}, {})",
            model,
            self.scopes.len(),
            if joined { "joined" } else { "root" }
        ))
    }

    fn add(&mut self, rest: &str) -> ReplResult<String> {
        let value: Value = serde_json::from_str(rest)?;
        let top = self.top_mut()?;
        match value {
            Value::Array(items) => {
                let added = top.add_all(items)?;
                let count = added.as_ref().map(Vec::len);
                Ok(status_line(top.status(), count.map(|n| format!("{} added", n))))
            }
            value => {
                let added = top.add(value)?;
                Ok(status_line(top.status(), added.map(|r| r.to_json().to_string())))
            }
        }
    }

    /// `update {"name": "ann"} set {"name": "anne"}`
    fn update(&mut self, rest: &str) -> ReplResult<String> {
        let (filter, rest) = leading_json(rest)?;
        let rest = rest.trim_start();
        let changes = rest.strip_prefix("set").unwrap_or(rest);
        let changes: Value = serde_json::from_str(changes)?;

        let top = self.top_mut()?;
        let Some(target) = top.query().filter_by(filter).first()? else {
            return Ok(Status::NotFound.to_string());
        };
        let updated = top.update(&target, changes)?;
        Ok(status_line(top.status(), updated.map(|r| r.to_json().to_string())))
    }

    fn delete(&mut self, rest: &str) -> ReplResult<String> {
        let filter = parse_optional(rest)?;
        let top = self.top_mut()?;
        let query = top.query().filter_by(filter);
        top.delete_where(Some(query), true)?;
        Ok(status_line(top.status(), None))
    }

    /// `find [filter-json] [page N]`
    fn find(&mut self, rest: &str) -> ReplResult<String> {
        let (filter, rest) = if rest.trim_start().starts_with('{') {
            leading_json(rest)?
        } else {
            (Value::Null, rest)
        };
        let page = match split_word(rest) {
            ("page", n) => Some(
                n.trim()
                    .parse::<usize>()
                    .map_err(|_| ReplError::Usage("find [filter] [page N]".into()))?,
            ),
            ("", _) => None,
            _ => return Err(ReplError::Usage("find [filter] [page N]".into())),
        };

        let top = self.top()?;
        let query = top.query().filter_by(filter);
        match page {
            Some(n) => {
                let page = query.paginate(PageRequest::new(n, 10))?;
                Ok(format!(
                    "{}\npage {}/{} ({} total)",
                    self.format_rows(&page.items),
                    page.page,
                    page.pages,
                    page.total.unwrap_or(0)
                ))
            }
            None => Ok(self.format_rows(&query.all()?)),
        }
    }

    fn state_text(&self) -> String {
        let mut lines = Vec::new();
        match self.manager.state(self.session.id()) {
            Some(state) => lines.push(format!(
                "root: active={} depth={} error={} origin={:?}",
                state.active, state.depth, state.error, state.origin
            )),
            None => lines.push("root: none".to_string()),
        }
        lines.push(format!(
            "session: in_transaction={} savepoints={}",
            self.session.in_transaction(),
            self.session.savepoint_depth()
        ));
        for (i, crud) in self.scopes.iter().enumerate() {
            let scope = crud.scope();
            lines.push(format!(
                "  {}: {} joined={} needs_commit={} status={} error={}",
                i + 1,
                crud.model(),
                scope.joined(),
                scope.needs_commit(),
                crud.status(),
                scope
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ));
        }
        lines.join("\n")
    }

    /// Exit every open scope as failed, innermost first.
    fn abort_all(&mut self) {
        while let Some(crud) = self.scopes.pop() {
            let model = crud.model().to_string();
            if let Err(e) = crud.abort() {
                tracing::error!(model = %model, error = %e, "failed to abort scope");
            }
        }
    }

    fn format_rows(&self, rows: &[Record]) -> String {
        if rows.is_empty() {
            return "(0 rows)".to_string();
        }

        let mut columns: Vec<String> = vec!["_pk".to_string()];
        let data_columns: BTreeSet<&String> = rows.iter().flat_map(|r| r.data.keys()).collect();
        columns.extend(data_columns.into_iter().cloned());

        let cell = |row: &Record, col: &str| -> String {
            if col == "_pk" {
                row.key.to_string()
            } else {
                row.get(col).map(format_value).unwrap_or_default()
            }
        };

        // Calculate column widths.
        let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
        for row in rows {
            for (i, col) in columns.iter().enumerate() {
                widths[i] = widths[i].max(cell(row, col).len());
            }
        }

        let mut out = Vec::new();
        let header: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
            .collect();
        out.push(header.join(" | "));
        let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push(sep.join("-+-"));

        let limit = rows.len().min(self.config.max_rows);
        for row in rows.iter().take(limit) {
            let values: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, col)| format!("{:width$}", cell(row, col), width = widths[i]))
                .collect();
            out.push(values.join(" | "));
        }

        if rows.len() > limit {
            out.push(format!("... ({} more rows)", rows.len() - limit));
        }
        out.push(format!("({} rows)", rows.len()));
        out.join("\n")
    }
}

impl Drop for Repl {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn help_text() -> String {
    [
        "Commands:",
        "  .help, .h, .?                 Show this help message",
        "  .quit, .exit, .q              Exit the REPL",
        "  .model <name> <col:type>...   Declare a model (type suffix ! = required, * = unique)",
        "  .tables, .dt                  List models",
        "  .schema <model>               Show a model's columns",
        "  .show <model>                 Show committed rows",
        "  .state                        Show root and scope state",
        "  .journal [clear]              Show transaction boundaries the session performed",
        "  .policy [raise|swallow]       Show or set the innermost scope's error policy",
        "  .history                      Show command history",
        "  .timing                       Toggle timing display",
        "",
        "Scope commands (work on the innermost open scope):",
        "  open <model> [defaults]       Open a scope, joining any open one",
        "  add <json|[json,...]>         Add one or several entities",
        "  update <filter> set <json>    Update the first match",
        "  delete [filter]               Delete every match",
        "  find [filter] [page N]        List matches",
        "  count [filter]                Count matches",
        "  commit | discard              Resolve pending changes now",
        "  close | abort                 Exit the scope normally or as failed",
        "  fail <begin|nested|commit|rollback|release|rollback_to|write>",
        "                                Make the next such session call fail",
    ]
    .join("\n")
}

fn describe(schema: &ModelSchema) -> String {
    let mut out = vec![
        format!("Model: {}", schema.name),
        format!("{:<20} {:<12} {:<10} {:<6}", "Name", "Type", "Nullable", "Unique"),
        format!("{:-<20} {:-<12} {:-<10} {:-<6}", "", "", "", ""),
    ];
    for col in &schema.columns {
        out.push(format!(
            "{:<20} {:<12} {:<10} {:<6}",
            col.name,
            col.data_type.to_string(),
            if col.is_nullable() { "YES" } else { "NO" },
            if col.is_unique() { "YES" } else { "NO" }
        ));
    }
    out.join("\n")
}

fn status_line(status: Status, detail: Option<String>) -> String {
    match detail {
        Some(detail) => format!("{} {}", status, detail),
        None => status.to_string(),
    }
}

fn table_name(name: &str) -> ReplResult<TableName> {
    TableName::new(name).map_err(|e| ReplError::Usage(e.to_string()))
}

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

/// Parse the JSON value at the start of `s`, returning it and the rest.
fn leading_json(s: &str) -> ReplResult<(Value, &str)> {
    let mut stream = serde_json::Deserializer::from_str(s).into_iter::<Value>();
    let value = match stream.next() {
        Some(value) => value?,
        None => return Err(ReplError::Usage("expected a JSON value".into())),
    };
    let offset = stream.byte_offset();
    Ok((value, &s[offset..]))
}

fn parse_optional(s: &str) -> ReplResult<Value> {
    if s.trim().is_empty() {
        Ok(Value::Null)
    } else {
        Ok(serde_json::from_str(s)?)
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
