use std::time::{Duration, Instant};

use medcall_core::{
    connect_signaling, fetch_call_status, status_is_active, SignalingConfig, SignalingEvent,
};

const USAGE: &str = "usage: call_probe <api_base_url> [--token T] [--status CALL_ID] \
                     [--listen SECS] [--signaling-url URL] [--user USER_ID]";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let api_base_url = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?;

    let mut token = std::env::var("MEDCALL_TOKEN").ok();
    let mut status_call_id: Option<String> = None;
    let mut listen_secs: Option<u64> = None;
    let mut signaling_url: Option<String> = None;
    let mut user_id: Option<String> = None;
    while let Some(a) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match a.as_str() {
            "--token" => token = Some(value("--token")?),
            "--status" => status_call_id = Some(value("--status")?),
            "--listen" => listen_secs = Some(value("--listen")?.parse()?),
            "--signaling-url" => signaling_url = Some(value("--signaling-url")?),
            "--user" => user_id = Some(value("--user")?),
            _ => return Err(anyhow::anyhow!("unknown arg: {a}\n{USAGE}")),
        }
    }
    let token = token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("--token or MEDCALL_TOKEN is required"))?;
    if status_call_id.is_none() && listen_secs.is_none() {
        return Err(anyhow::anyhow!("nothing to do: pass --status and/or --listen\n{USAGE}"));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        if let Some(call_id) = status_call_id {
            let started = Instant::now();
            let status = fetch_call_status(&api_base_url, &token, &call_id).await?;
            println!(
                "status call_id={call_id} status={status} active={} elapsed_ms={}",
                status_is_active(&status),
                started.elapsed().as_millis()
            );
        }

        if let Some(secs) = listen_secs {
            let config = SignalingConfig {
                url: signaling_url.unwrap_or_else(|| api_base_url.clone()),
                connect_timeout: Duration::from_secs(10),
                max_attempts: 3,
                backoff_base: Duration::from_millis(500),
                backoff_max: Duration::from_secs(8),
                heartbeat_interval: Duration::from_secs(25),
            };
            let started = Instant::now();
            let conn = connect_signaling(&config, &token).await?;
            println!("signaling ready elapsed_ms={}", started.elapsed().as_millis());

            let heartbeat = config.heartbeat_interval;
            let run = conn.run(heartbeat, user_id, |event| match event {
                SignalingEvent::IncomingCall(payload) => println!("event incoming_call {payload}"),
                other => println!("event {other:?}"),
            });
            match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok(Ok(())) => println!("signaling closed by server"),
                Ok(Err(e)) => return Err(anyhow::anyhow!("signaling failed: {e}")),
                Err(_) => println!("listen window elapsed"),
            }
        }
        Ok(())
    })
}
