use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use stackgraph_stacks::names::notifier::SCHEDULE_EXPRESSION;
use stackgraph_stacks::schedule::CronSchedule;

pub fn run_schedule(expression: Option<String>, days: u32) -> Result<()> {
    let expression = expression.unwrap_or_else(|| SCHEDULE_EXPRESSION.to_string());
    let schedule = CronSchedule::parse(&expression)
        .with_context(|| format!("Invalid schedule expression '{}'", expression))?;

    let start = Utc::now();
    let end = start + Duration::days(i64::from(days));
    let fires = schedule.fires_between(start, end);

    println!("Schedule: {}", schedule.expression());
    println!("{}", "-".repeat(40));
    for fire in &fires {
        println!("  {}", fire.format("%a %Y-%m-%d %H:%M UTC"));
    }
    println!();
    println!("{} firing(s) in the next {} day(s)", fires.len(), days);
    Ok(())
}
