//! HTML pages shown in the browser at the end of the OAuth redirect.

const STYLE: &str = "body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;\
background:#191414;color:#fff;display:flex;align-items:center;justify-content:center;\
min-height:100vh;margin:0}.card{background:#282828;border-radius:12px;padding:40px;\
max-width:480px;text-align:center}h1{margin-top:0}.ok{color:#1db954}.err{color:#e22134}\
p{color:#b3b3b3;line-height:1.5}";

pub fn success(display_name: Option<&str>) -> String {
    let greeting = match display_name {
        Some(name) => format!("Connected as <strong>{}</strong>.", escape(name)),
        None => "Your Spotify account is connected.".to_string(),
    };
    page(
        "Spotify connected",
        &format!(
            "<h1 class=\"ok\">Spotify connected</h1>\
             <p>{greeting}</p>\
             <p>You can close this window and go back to Discord. \
             Try <code>/top</code> or <code>/recommend</code>.</p>"
        ),
    )
}

pub fn failure(message: &str) -> String {
    page(
        "Spotify connection failed",
        &format!(
            "<h1 class=\"err\">Connection failed</h1><p>{}</p>\
             <p>You can close this window.</p>",
            escape(message)
        ),
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title}</title><style>{STYLE}</style></head>\
         <body><div class=\"card\">{body}</div></body></html>"
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
