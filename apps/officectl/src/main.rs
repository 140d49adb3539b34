use anyhow::Context;
use officeproto::token::ManagerTokenPayload;

fn usage_and_exit() -> ! {
    eprintln!(
        "officectl\n\n\
USAGE:\n\
  officectl [--url URL] <command> [args...]\n\n\
ENV:\n\
  PRESENCED_ADMIN_URL  default http://127.0.0.1:3010\n\n\
COMMANDS:\n\
  deploy-character <agentId> <name> [--avatar ID] [--workstation ID] [--x N --y N] [--namespace SLUG]\n\
  list-npcs\n\
  room-by-namespace <slug>\n\
  destroy-room <slug>\n\
  remove-npc <agentId>\n\
  persist-npc <agentId> [--x N --y N] [--posture sit|stand] [--workstation ID]\n\
  pathfind <startX> <startY> <targetX> <targetY>\n\
  mint-token <agentId> <namespace> --secret SECRET [--ttl SECONDS]\n"
    );
    std::process::exit(2);
}

fn take_flag_value(rest: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < rest.len() {
        if rest[i] == flag {
            return rest.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

async fn print_response(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v)?),
        Err(_) => println!("{body}"),
    }
    if !status.is_success() {
        anyhow::bail!("http={}", status.as_u16());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut base_url = std::env::var("PRESENCED_ADMIN_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:3010".to_string());

    let mut args = std::env::args().skip(1);
    let mut cmd: Option<String> = None;
    let mut rest: Vec<String> = Vec::new();

    while let Some(a) = args.next() {
        if a == "--url" {
            base_url = args.next().unwrap_or_else(|| usage_and_exit());
            continue;
        }
        cmd = Some(a);
        rest.extend(args);
        break;
    }
    let base_url = base_url.trim_end_matches('/').to_string();
    let Some(cmd) = cmd else { usage_and_exit() };

    let http = reqwest::Client::new();

    match cmd.as_str() {
        "deploy-character" => {
            if rest.len() < 2 {
                usage_and_exit();
            }
            let agent_id = rest[0].clone();
            let name = rest[1].clone();
            let flags = &rest[2..];
            let avatar = take_flag_value(flags, "--avatar").unwrap_or_else(|| "adam".to_string());
            let workstation = take_flag_value(flags, "--workstation")
                .unwrap_or_else(|| "design-studio".to_string());
            let x: f64 = take_flag_value(flags, "--x")
                .map(|v| v.parse().unwrap_or_else(|_| usage_and_exit()))
                .unwrap_or(800.0);
            let y: f64 = take_flag_value(flags, "--y")
                .map(|v| v.parse().unwrap_or_else(|_| usage_and_exit()))
                .unwrap_or(200.0);
            let mut body = serde_json::json!({
                "agentId": agent_id,
                "name": name,
                "avatarId": avatar,
                "workstationId": workstation,
                "position": { "x": x, "y": y },
            });
            if let Some(ns) = take_flag_value(flags, "--namespace") {
                body["namespaceSlug"] = ns.into();
            }
            let resp = http
                .post(format!("{base_url}/api/deploy-character"))
                .json(&body)
                .send()
                .await
                .context("deploy-character request")?;
            print_response(resp).await?;
        }
        "list-npcs" => {
            if !rest.is_empty() {
                usage_and_exit();
            }
            let resp = http.get(format!("{base_url}/api/npcs")).send().await?;
            print_response(resp).await?;
        }
        "room-by-namespace" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let resp = http
                .get(format!("{base_url}/api/rooms/by-namespace/{}", rest[0]))
                .send()
                .await?;
            print_response(resp).await?;
        }
        "destroy-room" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let resp = http
                .delete(format!("{base_url}/api/rooms/{}", rest[0]))
                .send()
                .await?;
            print_response(resp).await?;
        }
        "remove-npc" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let resp = http
                .delete(format!("{base_url}/api/npcs/{}", rest[0]))
                .send()
                .await?;
            print_response(resp).await?;
        }
        "persist-npc" => {
            if rest.is_empty() {
                usage_and_exit();
            }
            let agent_id = rest[0].clone();
            let flags = &rest[1..];
            let mut body = serde_json::Map::new();
            if let (Some(x), Some(y)) = (
                take_flag_value(flags, "--x"),
                take_flag_value(flags, "--y"),
            ) {
                let x: f64 = x.parse().unwrap_or_else(|_| usage_and_exit());
                let y: f64 = y.parse().unwrap_or_else(|_| usage_and_exit());
                body.insert("position".into(), serde_json::json!({ "x": x, "y": y }));
            }
            if let Some(p) = take_flag_value(flags, "--posture") {
                body.insert("posture".into(), p.into());
            }
            if let Some(w) = take_flag_value(flags, "--workstation") {
                body.insert("workstationId".into(), w.into());
            }
            let resp = http
                .post(format!("{base_url}/api/npcs/{agent_id}/persist"))
                .json(&serde_json::Value::Object(body))
                .send()
                .await?;
            print_response(resp).await?;
        }
        "pathfind" => {
            if rest.len() != 4 {
                usage_and_exit();
            }
            let nums: Vec<f64> = rest
                .iter()
                .map(|v| v.parse().unwrap_or_else(|_| usage_and_exit()))
                .collect();
            let resp = http
                .post(format!("{base_url}/api/pathfind"))
                .json(&serde_json::json!({
                    "start": { "x": nums[0], "y": nums[1] },
                    "target": { "x": nums[2], "y": nums[3] },
                }))
                .send()
                .await?;
            print_response(resp).await?;
        }
        "mint-token" => {
            if rest.len() < 2 {
                usage_and_exit();
            }
            let agent_id = rest[0].clone();
            let namespace = rest[1].clone();
            let flags = &rest[2..];
            let secret = take_flag_value(flags, "--secret").unwrap_or_else(|| usage_and_exit());
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            let exp = take_flag_value(flags, "--ttl")
                .map(|v| v.parse::<i64>().unwrap_or_else(|_| usage_and_exit()))
                .map(|ttl| now + ttl);
            let payload = ManagerTokenPayload {
                agent_id: Some(agent_id),
                namespace: Some(namespace),
                iat: Some(now),
                exp,
                ..Default::default()
            };
            println!("{}", presence_auth::sign_manager_token(&payload, &secret));
        }
        _ => usage_and_exit(),
    }

    Ok(())
}
