use std::time::Duration;

use domino_client::{ConnectionState, DominoClient, Endpoint, Snapshot};

const WAIT: Duration = Duration::from_secs(30);

fn load_live_endpoint() -> Result<Endpoint, String> {
    if std::env::var("DOMINO_HOST").is_err() {
        return Err("DOMINO_HOST is required".to_owned());
    }
    Endpoint::from_env()
}

async fn wait(client: &DominoClient, predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
    tokio::time::timeout(WAIT, client.wait_until(predicate))
        .await
        .expect("state must be reached in time")
        .expect("engine must be running")
}

#[tokio::test]
async fn live_schema_scan_and_pagination() {
    let endpoint = match load_live_endpoint() {
        Ok(endpoint) => endpoint,
        Err(_) => {
            eprintln!("skipping live test: DOMINO_HOST not set");
            return;
        }
    };

    let client = DominoClient::new();
    let state = client
        .connect(endpoint.host.clone(), endpoint.port)
        .await
        .expect("engine must be running");
    assert_eq!(
        state,
        ConnectionState::Ready,
        "server at {}:{} must accept connections",
        endpoint.host,
        endpoint.port
    );

    let state = wait(&client, |state| {
        !state.schema.is_empty() || state.error_message.is_some()
    })
    .await;
    assert_eq!(state.error_message, None);
    let relation = state.schema[0].clone();

    client
        .submit(&relation.scan_query())
        .expect("engine must be running");
    let state = wait(&client, |state| {
        state.results.len() == 1 && !state.results[0].is_loading
    })
    .await;
    let result = &state.results[0];
    assert_eq!(result.error_message, None, "scan of {} failed", relation.name);
    assert!(result.session_id.is_some());

    if result.has_more_rows {
        let id = result.id;
        let before = result.table.as_ref().map_or(0, |table| table.row_count());
        client.load_more(id).expect("engine must be running");
        let state = wait(&client, |state| {
            state.result(id).is_some_and(|result| {
                !result.is_loading
                    && (result.error_message.is_some()
                        || result
                            .table
                            .as_ref()
                            .is_some_and(|table| table.row_count() > before))
            })
        })
        .await;
        assert_eq!(state.result(id).and_then(|r| r.error_message.clone()), None);
    }

    client
        .submit("{scan, no_such_relation_for_live_test}")
        .expect("engine must be running");
    let state = wait(&client, |state| {
        state.results.len() == 1
            && state.results[0].query == "{scan, no_such_relation_for_live_test}"
            && !state.results[0].is_loading
    })
    .await;
    assert!(state.results[0].error_message.is_some());
    assert!(state.is_connected);

    client.disconnect().expect("engine must be running");
    let state = wait(&client, |state| {
        state.connection == ConnectionState::Cancelled
    })
    .await;
    assert!(state.results.is_empty());
}
