use std::path::{Path, PathBuf};

use tabula_adapters::export::{export_result_to_csv, export_result_to_json};
use tabula_core::backend::{EmbeddedBackend, RemoteTransport};
use tabula_core::connections::{ConnectionDescriptor, Credentials};
use tabula_core::import::{ImportFile, ImportPipeline};
use tabula_core::results::QueryResult;
use tabula_core::session::SessionController;
use tabula_core::tabs::TabKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const HELP: &str = "\
commands:
  <sql>                         run a statement in the active tab
  .status                       show the active connection
  .connections                  list saved connections
  .connect <id>                 switch to a saved connection
  .add <name> <host> <port> [user] [password]
                                save a remote connection after a test query
  .remove <id>                  delete a saved connection
  .import <path> [table]        load a csv/json/parquet/arrow/duckdb file
  .drop <database> <table>      drop a table
  .use <database>               select the current database
  .schema                       list databases and tables
  .tabs | .tab new | .tab close <id> | .tab <id>
  .history                      recent queries, newest first
  .export <path.csv|path.json>  write the active tab's last result
  .quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Sql(String),
    Status,
    Connections,
    Connect(String),
    AddRemote {
        name: String,
        host: String,
        port: u16,
        credentials: Option<Credentials>,
    },
    Remove(String),
    Import {
        path: PathBuf,
        table: Option<String>,
    },
    Drop {
        database: String,
        table: String,
    },
    Use(String),
    Schema,
    Tabs,
    NewTab,
    CloseTab(String),
    SwitchTab(String),
    History,
    Export(PathBuf),
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(directive) = line.strip_prefix('.') else {
        return Ok(Command::Sql(line.to_string()));
    };

    let words = directive.split_whitespace().collect::<Vec<_>>();
    let command = match words.as_slice() {
        ["status"] => Command::Status,
        ["connections"] => Command::Connections,
        ["connect", id] => Command::Connect((*id).to_string()),
        ["add", name, host, port, rest @ ..] if rest.len() <= 2 => {
            let port = port
                .parse()
                .map_err(|_| format!("invalid port `{port}`"))?;
            let credentials = rest.first().map(|user| {
                Credentials::new(*user, rest.get(1).copied().unwrap_or_default())
            });
            Command::AddRemote {
                name: (*name).to_string(),
                host: (*host).to_string(),
                port,
                credentials,
            }
        }
        ["remove", id] => Command::Remove((*id).to_string()),
        ["import", path] => Command::Import {
            path: PathBuf::from(path),
            table: None,
        },
        ["import", path, table] => Command::Import {
            path: PathBuf::from(path),
            table: Some((*table).to_string()),
        },
        ["drop", database, table] => Command::Drop {
            database: (*database).to_string(),
            table: (*table).to_string(),
        },
        ["use", database] => Command::Use((*database).to_string()),
        ["schema"] => Command::Schema,
        ["tabs"] => Command::Tabs,
        ["tab", "new"] => Command::NewTab,
        ["tab", "close", id] => Command::CloseTab((*id).to_string()),
        ["tab", id] => Command::SwitchTab((*id).to_string()),
        ["history"] => Command::History,
        ["export", path] => Command::Export(PathBuf::from(path)),
        ["help"] => Command::Help,
        ["quit" | "exit"] => Command::Quit,
        _ => return Err(format!("unknown command `.{directive}`, try .help")),
    };
    Ok(command)
}

/// Reads commands line by line until EOF or `.quit`.
pub async fn run<E, T, R, W>(
    session: &mut SessionController<E, T>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    E: EmbeddedBackend,
    T: RemoteTransport,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let output = match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => dispatch(session, command).await,
            Err(message) => message,
        };
        if !output.is_empty() {
            writer.write_all(output.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

async fn dispatch<E, T>(session: &mut SessionController<E, T>, command: Command) -> String
where
    E: EmbeddedBackend,
    T: RemoteTransport,
{
    match command {
        Command::Empty | Command::Quit => String::new(),
        Command::Help => HELP.to_string(),
        Command::Sql(sql) => {
            let tab_id = {
                let mut workspace = session.workspace().lock().await;
                let on_query_tab = workspace
                    .tabs
                    .active()
                    .is_some_and(|tab| tab.kind == TabKind::Query);
                if on_query_tab {
                    let tab_id = workspace.tabs.active_id().to_string();
                    if let Err(error) = workspace.tabs.update_content(&tab_id, sql.clone()) {
                        tracing::debug!(%error, "active tab vanished");
                    }
                    tab_id
                } else {
                    workspace
                        .tabs
                        .create(TabKind::Query, Some(sql.clone()), None)
                        .id
                        .clone()
                }
            };
            render_result(&session.execute(&sql, Some(&tab_id)).await)
        }
        Command::Status => {
            let status = session.status().await;
            let mut out = format!(
                "{:?} on {}",
                status.phase,
                status.connection_name.as_deref().unwrap_or("nothing")
            );
            if let Some(error) = status.last_error {
                out.push_str(&format!("\nlast error: {error}"));
            }
            out
        }
        Command::Connections => session
            .registry()
            .list()
            .iter()
            .map(|descriptor| {
                let target = match (&descriptor.host, descriptor.port) {
                    (Some(host), Some(port)) => format!("{host}:{port}"),
                    (Some(host), None) => host.clone(),
                    _ => "embedded".to_string(),
                };
                format!("{}  {}  {target}", descriptor.id, descriptor.name)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Command::Connect(id) => match session.connect(&id).await {
            Ok(()) => format!("connected to {id}"),
            Err(error) => format!("error: {error}"),
        },
        Command::AddRemote {
            name,
            host,
            port,
            credentials,
        } => {
            let mut descriptor = ConnectionDescriptor::remote(name, host, port);
            descriptor.credentials = credentials;
            let id = descriptor.id.clone();
            match session.add_connection(descriptor).await {
                Ok(()) => format!("saved connection {id}"),
                Err(error) => format!("error: {error}"),
            }
        }
        Command::Remove(id) => match session.remove_connection(&id).await {
            Ok(()) => format!("removed {id}"),
            Err(error) => format!("error: {error}"),
        },
        Command::Import { path, table } => import(session, &path, table).await,
        Command::Drop { database, table } => match session.delete_table(&database, &table).await {
            Ok(()) => format!("dropped {database}.{table}"),
            Err(error) => format!("error: {error}"),
        },
        Command::Use(database) => {
            session.set_current_database(database.clone()).await;
            format!("using {database}")
        }
        Command::Schema => {
            let catalog = session.workspace().lock().await.schema.catalog();
            let mut out = Vec::new();
            for database in &catalog.databases {
                out.push(database.name.clone());
                for table in &database.tables {
                    let rows = table
                        .row_count
                        .map_or_else(String::new, |count| format!(" ({count} rows)"));
                    out.push(format!("  {}.{}{rows}", table.schema, table.name));
                }
            }
            out.join("\n")
        }
        Command::Tabs => {
            let workspace = session.workspace().lock().await;
            let active = workspace.tabs.active_id().to_string();
            workspace
                .tabs
                .tabs()
                .iter()
                .map(|tab| {
                    let marker = if tab.id == active { '*' } else { ' ' };
                    format!("{marker} {}  {}", tab.id, tab.title)
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::NewTab => {
            let mut workspace = session.workspace().lock().await;
            let tab = workspace.tabs.create(TabKind::Query, None, None);
            format!("opened {} ({})", tab.title, tab.id)
        }
        Command::CloseTab(id) => match session.workspace().lock().await.tabs.close(&id) {
            Ok(tab) => format!("closed {}", tab.title),
            Err(error) => format!("error: {error}"),
        },
        Command::SwitchTab(id) => match session.workspace().lock().await.tabs.set_active(&id) {
            Ok(()) => format!("switched to {id}"),
            Err(error) => format!("error: {error}"),
        },
        Command::History => {
            let workspace = session.workspace().lock().await;
            workspace
                .history
                .entries()
                .map(|entry| {
                    let time = entry.timestamp.format("%H:%M:%S");
                    match &entry.error {
                        Some(error) => format!("{time}  {}  [{error}]", entry.query_text),
                        None => format!("{time}  {}", entry.query_text),
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::Export(path) => {
            let result = session
                .workspace()
                .lock()
                .await
                .tabs
                .active()
                .and_then(|tab| tab.last_result.clone());
            match result {
                Some(result) => export(&path, &result),
                None => "error: the active tab has no result yet".to_string(),
            }
        }
    }
}

async fn import<E, T>(
    session: &SessionController<E, T>,
    path: &Path,
    table: Option<String>,
) -> String
where
    E: EmbeddedBackend,
    T: RemoteTransport,
{
    let file = match ImportFile::from_path(path).await {
        Ok(file) => file,
        Err(error) => return format!("error: {error}"),
    };
    let file_name = file.file_name.clone();
    let mut pipeline = ImportPipeline::default();
    if let Some(rejected) = pipeline.submit(vec![file]).into_iter().next() {
        return format!("error: {rejected}");
    }
    if let Some(table) = table {
        if let Err(error) = pipeline.set_target_table(&file_name, table) {
            return format!("error: {error}");
        }
    }

    match pipeline.start_upload(session).await {
        Ok(summary) if summary.failed == 0 => format!("imported {file_name}"),
        Ok(_) => pipeline
            .jobs()
            .await
            .into_iter()
            .filter_map(|job| job.error)
            .map(|error| format!("error: {error}"))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(error) => format!("error: {error}"),
    }
}

fn export(path: &Path, result: &QueryResult) -> String {
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase());
    let written = match extension.as_deref() {
        Some("csv") => export_result_to_csv(path, result),
        Some("json") => export_result_to_json(path, result),
        _ => return "error: export path must end in .csv or .json".to_string(),
    };
    match written {
        Ok(rows) => format!("wrote {rows} rows to {}", path.display()),
        Err(error) => format!("error: {error}"),
    }
}

fn render_result(result: &QueryResult) -> String {
    if let Some(error) = &result.error {
        return format!("error: {error}");
    }
    if result.columns.is_empty() {
        return "ok".to_string();
    }

    let cells = (0..result.rows.len())
        .filter_map(|index| result.row_values(index))
        .map(|values| values.iter().map(ToString::to_string).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let widths = result
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            cells
                .iter()
                .map(|row| row[index].chars().count())
                .fold(column.chars().count(), usize::max)
        })
        .collect::<Vec<_>>();

    let format_line = |values: Vec<&str>| {
        values
            .iter()
            .zip(&widths)
            .map(|(value, width)| format!("{value:<width$}", width = *width))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![format_line(result.columns.iter().map(String::as_str).collect())];
    lines.push(
        widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &cells {
        lines.push(format_line(row.iter().map(String::as_str).collect()));
    }
    let noun = if result.row_count == 1 { "row" } else { "rows" };
    lines.push(format!("({} {noun})", result.row_count));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use tabula_adapters::{DuckDbBackend, ReqwestTransport};
    use tabula_core::connections::Credentials;
    use tabula_core::results::{CellValue, QueryResult};
    use tabula_core::session::{SessionController, SessionOptions};
    use tempfile::TempDir;

    use super::{parse_command, render_result, run, Command};

    #[test]
    fn parses_directives_and_sql() {
        assert_eq!(parse_command("   "), Ok(Command::Empty));
        assert_eq!(
            parse_command("SELECT 1"),
            Ok(Command::Sql("SELECT 1".to_string()))
        );
        assert_eq!(
            parse_command(".import data/sales.csv sales_2024"),
            Ok(Command::Import {
                path: PathBuf::from("data/sales.csv"),
                table: Some("sales_2024".to_string()),
            })
        );
        assert_eq!(
            parse_command(".add prod ch.local 8123 default secret"),
            Ok(Command::AddRemote {
                name: "prod".to_string(),
                host: "ch.local".to_string(),
                port: 8123,
                credentials: Some(Credentials::new("default", "secret")),
            })
        );
        assert_eq!(parse_command(".tab new"), Ok(Command::NewTab));
        assert_eq!(parse_command(".exit"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_unknown_directives_and_bad_ports() {
        assert!(parse_command(".frobnicate").is_err());
        assert!(parse_command(".add prod host notaport")
            .is_err_and(|message| message.contains("invalid port")));
    }

    #[test]
    fn renders_aligned_table() {
        let result = QueryResult {
            columns: vec!["id".to_string(), "name".to_string()],
            column_types: vec!["INTEGER".to_string(), "VARCHAR".to_string()],
            rows: vec![BTreeMap::from([
                ("id".to_string(), CellValue::Int(1)),
                ("name".to_string(), CellValue::Text("alpha".to_string())),
            ])],
            row_count: 1,
            error: None,
        };

        let rendered = render_result(&result);
        assert_eq!(rendered, "id | name\n---+------\n1  | alpha\n(1 row)");
        assert_eq!(render_result(&QueryResult::failed("boom")), "error: boom");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_session_imports_queries_and_exports() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let csv_path = temp_dir.path().join("sales.csv");
        std::fs::write(&csv_path, "region,amount\nnorth,10\nsouth,20\n").expect("write csv");
        let export_path = temp_dir.path().join("out.json");

        let mut session = SessionController::new(
            DuckDbBackend::in_memory(),
            ReqwestTransport::default(),
            SessionOptions {
                baseline_extensions: Vec::new(),
            },
        );
        session.initialize_default().await.expect("engine should boot");

        let script = format!(
            ".import {}\nSELECT COUNT(*) AS n FROM sales\n.export {}\n.history\n.quit\nSELECT 'never'\n",
            csv_path.display(),
            export_path.display()
        );
        let mut output = Vec::new();
        run(&mut session, script.as_bytes(), &mut output)
            .await
            .expect("shell should run");
        let output = String::from_utf8(output).expect("utf8 output");

        assert!(output.contains("imported sales.csv"), "{output}");
        assert!(output.contains("(1 row)"), "{output}");
        assert!(!output.contains("never"), "{output}");
        let exported = std::fs::read_to_string(&export_path).expect("export written");
        let parsed: serde_json::Value = serde_json::from_str(&exported).expect("valid json");
        assert_eq!(parsed[0]["n"], 2);
    }
}
