//! Demo DDP server: a shared `items` collection where each user sees only
//! their own items.
//!
//! ```text
//! LIVEDATA_BIND_ADDR=0.0.0.0:3000 RUST_LOG=info livedata-server
//! ```

use log::info;
use serde_json::json;

use livedata_core::{Collection, Value};
use livedata_sync::{
    DdpServer, HandlerError, InvocationType, MethodError, MethodInvocation, Publication, Rule, RuleMatcher, ServerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let server = DdpServer::new(ServerConfig::from_env());
    let items = Collection::new("items");

    let published = items.clone();
    server.publish("items", move |sub, _params| {
        let Some(owner) = sub.user_id() else {
            sub.ready();
            return Ok(Publication::Manual);
        };
        Ok(published.find(&Value::from(json!({ "owner": owner })))?.into())
    });

    server.method("login", login);

    let writable = items.clone();
    server.method("items.insert", move |inv, params| insert_item(writable.clone(), inv, params));

    server.add_rate_limit_rule(
        Rule {
            type_: Some(InvocationType::Method),
            name: RuleMatcher::Exact("items.insert".to_string()),
            connection_id: RuleMatcher::matcher(|_| true),
            ..Default::default()
        },
        20,
        1000,
    );

    server.on_connection(|conn| info!("Session {} from {}", conn.id(), conn.client_address()));

    server.run().await
}

async fn login(mut inv: MethodInvocation, params: Vec<Value>) -> Result<Value, HandlerError> {
    let Some(user) = params.first().and_then(Value::as_str).map(str::to_string) else {
        return Err(MethodError::new(400, "Expected a user name").into());
    };
    info!("Connection {} logged in as {user}", inv.connection().id());
    inv.set_user_id(Some(user.clone()));
    Ok(Value::from(user))
}

async fn insert_item(items: Collection, mut inv: MethodInvocation, params: Vec<Value>) -> Result<Value, HandlerError> {
    let Some(owner) = inv.user_id().map(str::to_string) else {
        return Err(MethodError::new(403, "Not logged in").into());
    };
    let mut doc = match params.into_iter().next() {
        Some(Value::Object(doc)) => doc,
        _ => return Err(MethodError::new(400, "Expected a document").into()),
    };
    doc.insert("owner".to_string(), Value::from(owner));
    Ok(inv.insert(&items, doc)?)
}
