use anyhow::{Context, Result};
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::{
    config::Settings,
    dart::ScoredDisclosure,
    stocks::{portfolio_totals, MonitoringStock, StockCategory, TriggeredAlert},
    utils::format_won,
};

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
}

struct SmtpTarget {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

/// SMTP delivery; a disabled mailer only logs subjects.
pub struct Mailer {
    target: Option<SmtpTarget>,
}

impl Mailer {
    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn from_settings(s: &Settings) -> Result<Self> {
        if !s.email_enabled {
            return Ok(Self::disabled());
        }
        let from: Mailbox = s
            .email_sender
            .parse()
            .with_context(|| format!("EMAIL_SENDER {}", s.email_sender))?;
        let to: Mailbox = s
            .email_receiver
            .parse()
            .with_context(|| format!("EMAIL_RECEIVER {}", s.email_receiver))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&s.smtp_server)
            .with_context(|| format!("smtp relay {}", s.smtp_server))?
            .port(s.smtp_port)
            .credentials(Credentials::new(s.email_sender.clone(), s.email_password.clone()))
            .build();
        Ok(Self {
            target: Some(SmtpTarget { transport, from, to }),
        })
    }

    pub fn enabled(&self) -> bool {
        self.target.is_some()
    }

    /// `Ok(false)` when delivery is disabled.
    pub async fn send(&self, msg: &EmailMessage) -> Result<bool> {
        let Some(t) = &self.target else {
            log::debug!("email.skipped subject={:?}", msg.subject);
            return Ok(false);
        };
        let email = Message::builder()
            .from(t.from.clone())
            .to(t.to.clone())
            .subject(msg.subject.clone())
            .multipart(MultiPart::alternative_plain_html(msg.text.clone(), msg.html.clone()))
            .context("build email")?;
        t.transport.send(email).await.context("smtp send")?;
        log::info!("email.sent subject={:?}", msg.subject);
        Ok(true)
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn html_page(title: &str, body: &str) -> String {
    format!(
        "<html><body style=\"font-family:sans-serif\"><h2>{}</h2>{}<p style=\"color:#888;font-size:12px\">investwatch</p></body></html>",
        escape_html(title),
        body
    )
}

fn html_rows(rows: &[(&str, String)]) -> String {
    let mut out = String::from("<table cellpadding=\"4\">");
    for (k, v) in rows {
        out.push_str(&format!(
            "<tr><td><b>{}</b></td><td>{}</td></tr>",
            escape_html(k),
            escape_html(v)
        ));
    }
    out.push_str("</table>");
    out
}

fn text_rows(rows: &[(&str, String)]) -> String {
    rows.iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn opt_won(v: Option<f64>) -> String {
    v.map(format_won).unwrap_or_else(|| "-".to_string())
}

fn opt_pct(v: Option<f64>) -> String {
    v.map(|x| format!("{x:+.2}%")).unwrap_or_else(|| "-".to_string())
}

pub fn dart_alert_email(d: &ScoredDisclosure) -> EmailMessage {
    let x = &d.disclosure;
    let rows = [
        ("Company", x.corp_name.clone()),
        ("Report", x.report_nm.clone()),
        ("Filed", x.rcept_dt.clone()),
        ("Filer", x.flr_nm.clone()),
        ("Keywords", d.matched_keywords.join(", ")),
        ("Priority", d.priority_score.to_string()),
        ("Link", d.dart_url.clone()),
    ];
    let title = format!("{} - {}", x.corp_name, x.report_nm);
    EmailMessage {
        subject: format!("[DART] {title}"),
        text: text_rows(&rows),
        html: html_page(&title, &html_rows(&rows)),
    }
}

pub fn stock_alert_email(a: &TriggeredAlert) -> EmailMessage {
    let mut rows = vec![
        ("Stock", format!("{} ({})", a.name, a.code)),
        ("Alert", a.kind.label().to_string()),
        ("Current price", format_won(a.current_price)),
        ("Target price", format_won(a.target_price)),
        ("Daily change", format!("{:+.2}%", a.change_rate)),
    ];
    if let Some(p) = a.parity {
        rows.push(("Parity", format!("{p:.2}%")));
    }
    rows.push(("Message", a.message.clone()));
    EmailMessage {
        subject: format!("[Stock alert] {}({}) - {}", a.name, a.code, a.kind.label()),
        text: text_rows(&rows),
        html: html_page(&a.message, &html_rows(&rows)),
    }
}

pub fn system_alert_email(title: &str, message: &str, level: &str) -> EmailMessage {
    let rows = [("Level", level.to_string()), ("Message", message.to_string())];
    EmailMessage {
        subject: format!("[System] {title}"),
        text: text_rows(&rows),
        html: html_page(title, &html_rows(&rows)),
    }
}

/// End-of-day table split into mezzanine (with parity) and other holdings.
pub fn daily_summary_email(stocks: &[MonitoringStock], day: &str) -> EmailMessage {
    let mut text = String::new();
    let mut html = String::new();
    for (label, category) in [("Mezzanine", StockCategory::Mezzanine), ("Other", StockCategory::Other)] {
        let group: Vec<&MonitoringStock> = stocks.iter().filter(|s| s.category == category).collect();
        if group.is_empty() {
            continue;
        }
        text.push_str(&format!("== {label} ==\n"));
        html.push_str(&format!(
            "<h3>{label}</h3><table border=\"1\" cellpadding=\"4\" style=\"border-collapse:collapse\">\
<tr><th>Stock</th><th>Price</th><th>Change</th><th>P/L</th><th>P/L %</th><th>Parity</th></tr>"
        ));
        for s in group {
            let v = s.view();
            let parity = v.parity.map(|p| format!("{p:.2}%")).unwrap_or_else(|| "-".into());
            text.push_str(&format!(
                "{} ({}) price={} change={} pl={} pl_rate={} parity={}\n",
                s.name,
                s.code,
                opt_won(s.current_price),
                opt_pct(s.change_rate),
                opt_won(v.profit_loss),
                opt_pct(v.profit_loss_rate),
                parity
            ));
            html.push_str(&format!(
                "<tr><td>{} ({})</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&s.name),
                escape_html(&s.code),
                opt_won(s.current_price),
                opt_pct(s.change_rate),
                opt_won(v.profit_loss),
                opt_pct(v.profit_loss_rate),
                parity
            ));
        }
        html.push_str("</table>");
    }
    let t = portfolio_totals(stocks);
    let totals = format!(
        "Total value {} / P&L {} ({:+.2}%)",
        format_won(t.total_value),
        format_won(t.total_profit_loss),
        t.total_profit_loss_rate
    );
    text.push_str(&totals);
    html.push_str(&format!("<p><b>{}</b></p>", escape_html(&totals)));
    let title = format!("Daily close summary - {day}");
    EmailMessage {
        subject: format!("[Summary] {title}"),
        text,
        html: html_page(&title, &html),
    }
}

#[cfg(test)]
impl Mailer {
    /// Plain SMTP against a local port nothing listens on; every send fails.
    pub fn unreachable(port: u16) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
            .port(port)
            .timeout(Some(std::time::Duration::from_secs(2)))
            .build();
        let mbox = |s: &str| s.parse::<Mailbox>().unwrap();
        Self {
            target: Some(SmtpTarget {
                transport,
                from: mbox("monitor@example.com"),
                to: mbox("ops@example.com"),
            }),
        }
    }
}
