//! Query command implementation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Result body of `GET /views/{name}`.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    columns: Vec<String>,
    rows: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Arguments of `rill query`.
#[derive(Debug, Default)]
pub struct QueryArgs {
    pub view: String,
    pub select: Option<String>,
    pub filter: Option<String>,
    pub limit: Option<usize>,
    pub json: bool,
}

/// Query a running view over HTTP and print the rows.
pub async fn run(url: &str, args: QueryArgs) -> Result<()> {
    let endpoint = format!("{}/views/{}", url.trim_end_matches('/'), args.view);

    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(select) = &args.select {
        params.push(("select", select.clone()));
    }
    if let Some(filter) = &args.filter {
        params.push(("where", filter.clone()));
    }
    if let Some(limit) = args.limit {
        params.push(("limit", limit.to_string()));
    }

    let response = reqwest::Client::new()
        .get(&endpoint)
        .query(&params)
        .send()
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        bail!("Query failed (HTTP {}): {}", status.as_u16(), message);
    }

    let result: QueryResponse = response
        .json()
        .await
        .context("Failed to parse query response")?;

    if args.json {
        for row in &result.rows {
            println!("{}", row);
        }
    } else {
        print!("{}", render_table(&result));
        println!("({} rows)", result.rows.len());
    }

    Ok(())
}

fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "NULL".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn render_table(result: &QueryResponse) -> String {
    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .map(|column| cell(row.get(column)))
                .collect()
        })
        .collect();

    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            cells
                .iter()
                .map(|row| row[i].len())
                .chain(std::iter::once(column.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let format_line = |values: &[String]| -> String {
        let padded: Vec<String> = values
            .iter()
            .zip(&widths)
            .map(|(value, width)| format!("{:<width$}", value, width = width))
            .collect();
        format!("{}\n", padded.join(" | ").trim_end())
    };

    let mut out = format_line(&result.columns);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("{}\n", rule.join("-+-")));
    for row in &cells {
        out.push_str(&format_line(row));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_table() {
        let result = QueryResponse {
            columns: vec!["zipcode".into(), "temp".into()],
            rows: vec![
                json!({"zipcode": "12345", "temp": 70}),
                json!({"zipcode": "9", "temp": null}),
            ],
        };
        let table = render_table(&result);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "zipcode | temp");
        assert_eq!(lines[1], "--------+-----");
        assert_eq!(lines[2], "12345   | 70");
        assert_eq!(lines[3], "9       | NULL");
    }

    #[test]
    fn test_error_body_parses() {
        let e: ErrorResponse =
            serde_json::from_str(r#"{"error":"View not found: nope"}"#).unwrap();
        assert_eq!(e.error, "View not found: nope");
    }
}
