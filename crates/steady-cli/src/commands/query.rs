//! One-shot query command.

use steady_core::Error;

use crate::AppContext;

pub async fn run(
    ctx: &AppContext,
    url: &str,
    data: Option<&str>,
    key: Option<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let mut request = super::build_request(url, data, timeout)?;
    if let Some(key) = key {
        request = request.with_rate_key(key);
    }

    let response = ctx.executor.execute(&request).await.map_err(Error::from)?;
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(())
}
