use std::time::Duration;

use domino_client::{
    ConnectionState, DominoClient, Endpoint, QueryResult, Snapshot, EXAMPLE_QUERIES,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const SETTLE: Duration = Duration::from_secs(15);

const HELP: &str = "\
commands:
  :connect [host] [port]   connect (defaults from DOMINO_HOST / DOMINO_PORT)
  :disconnect              close sessions and drop the connection
  :more <n>                load the next batch of result n
  :close <n>               close result n
  :clear                   close every result
  :schema                  print the relation listing
  :refresh                 fetch the schema again
  :format <text>           print text in canonical spacing
  :examples                list bundled example expressions
  :json                    print the current state as JSON
  :quit                    exit
anything else is submitted as one or more expressions";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let endpoint = Endpoint::from_env().map_err(anyhow::Error::msg)?;
    let client = DominoClient::new();

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            ":quit" | ":q" => break,
            ":help" => println!("{HELP}"),
            ":connect" => {
                let mut args = rest.split_whitespace();
                let host = args.next().unwrap_or(endpoint.host.as_str()).to_owned();
                let port = match args.next() {
                    Some(port) => port.parse()?,
                    None => endpoint.port,
                };
                let state = client.connect(host.clone(), port).await?;
                println!("{host}:{port} -> {state}");
                if state == ConnectionState::Ready {
                    let state = settle(&client, |state| {
                        !state.schema.is_empty() || state.error_message.is_some()
                    })
                    .await;
                    print_schema(&state);
                }
            }
            ":disconnect" => {
                client.disconnect()?;
                let state = settle(&client, |state| {
                    state.connection == ConnectionState::Cancelled
                })
                .await;
                println!("{}", state.connection);
            }
            ":more" => {
                let Some(result) = pick(&client.snapshot(), rest) else {
                    eprintln!("no result {rest}");
                    continue;
                };
                let (id, before) = (result.id, rows(&result));
                client.load_more(id)?;
                let state = settle(&client, |state| {
                    state.result(id).is_some_and(|result| {
                        !result.is_loading
                            && (rows(result) != before || result.error_message.is_some())
                    })
                })
                .await;
                print_results(&state);
            }
            ":close" => {
                let Some(result) = pick(&client.snapshot(), rest) else {
                    eprintln!("no result {rest}");
                    continue;
                };
                let id = result.id;
                client.close(id)?;
                let state = settle(&client, |state| state.result(id).is_none()).await;
                print_results(&state);
            }
            ":clear" => {
                client.clear()?;
                settle(&client, |state| state.results.is_empty()).await;
            }
            ":schema" => print_schema(&client.snapshot()),
            ":refresh" => {
                client.refresh_schema()?;
                let state = settle(&client, |state| !state.schema.is_empty()).await;
                print_schema(&state);
            }
            ":format" => println!("{}", DominoClient::format(rest)),
            ":examples" => {
                for (label, query) in EXAMPLE_QUERIES {
                    println!("{label:<18} {query}");
                }
            }
            ":json" => println!("{}", serde_json::to_string_pretty(&client.snapshot())?),
            _ if command.starts_with(':') => eprintln!("unknown command {command}, try :help"),
            _ => {
                let before = client.snapshot();
                client.submit(line)?;
                let state = settle(&client, |state| {
                    *state != before
                        && (state.error_message.is_some()
                            || (!state.results.is_empty() && !state.is_loading))
                })
                .await;
                print_results(&state);
            }
        }
    }

    client.disconnect()?;
    Ok(())
}

/// Waits for `predicate`, falling back to the latest state after a while.
async fn settle(client: &DominoClient, predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
    match tokio::time::timeout(SETTLE, client.wait_until(predicate)).await {
        Ok(Ok(state)) => state,
        _ => client.snapshot(),
    }
}

fn pick(state: &Snapshot, index: &str) -> Option<QueryResult> {
    let index: usize = index.parse().ok()?;
    state.results.get(index.checked_sub(1)?).cloned()
}

fn rows(result: &QueryResult) -> usize {
    result.table.as_ref().map_or(0, |table| table.row_count())
}

fn print_schema(state: &Snapshot) {
    if let Some(error) = &state.error_message {
        eprintln!("error: {error}");
    }
    for relation in &state.schema {
        let attributes: Vec<_> = relation
            .attributes
            .iter()
            .map(|attribute| format!("{}: {}", attribute.name, attribute.type_name))
            .collect();
        println!(
            "{} ({} rows) [{}]",
            relation.name,
            relation.cardinality,
            attributes.join(", ")
        );
    }
}

fn print_results(state: &Snapshot) {
    if let Some(error) = &state.error_message {
        eprintln!("error: {error}");
    }
    for (index, result) in state.results.iter().enumerate() {
        println!("[{}] {}", index + 1, result.query);
        if let Some(error) = &result.error_message {
            eprintln!("    error: {error}");
        }
        if let Some(table) = &result.table {
            for line in table.to_tsv().lines() {
                println!("    {line}");
            }
        }
        let elapsed = result
            .execution_time
            .map(|time| format!(" in {time:?}"))
            .unwrap_or_default();
        let more = if result.has_more_rows {
            format!(", more available (:more {})", index + 1)
        } else {
            String::new()
        };
        println!("    {} row(s){elapsed}{more}", rows(result));
    }
}
