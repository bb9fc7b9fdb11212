use anyhow::{Context, Result};
use bbmark_engine::{AttrSchema, Parser, RegexFilter, SchemaBuilder, flags};
use regex::Regex;
use std::io::Read;
use std::{env, fs, io, process};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let text = match args.len() {
        1 => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
        2 => fs::read_to_string(&args[1])
            .with_context(|| format!("failed to read '{}'", args[1]))?,
        _ => {
            eprintln!("Usage: {} [input-file]", args[0]);
            eprintln!("Reads BBCode-style markup and prints the intermediate representation.");
            process::exit(1);
        }
    };

    let mut parser = build_parser()?;
    let ir = parser.parse(&text)?;
    println!("{ir}");
    Ok(())
}

/// A parser preloaded with a small default BBCode dialect.
fn build_parser() -> Result<Parser> {
    let mut builder = SchemaBuilder::new();
    for name in ["b", "i", "u", "s"] {
        builder.tag(name).rule_flags(flags::AUTO_REOPEN);
    }
    builder.tag("url").attribute(
        "url",
        AttrSchema::required().with_filter(RegexFilter::new(r"https?://\S+")?),
    );
    builder
        .tag("quote")
        .nesting_limit(5)
        .rule_flags(flags::TRIM_BEFORE | flags::TRIM_AFTER)
        .attribute("author", AttrSchema::optional());
    builder
        .tag("list")
        .only_children(&["li"])
        .rule_flags(flags::IGNORE_TEXT | flags::TRIM_BEFORE | flags::TRIM_AFTER);
    builder
        .tag("li")
        .require_ancestor("list")
        .close_parent("li")
        .rule_flags(flags::TRIM_BEFORE | flags::TRIM_AFTER);
    builder
        .tag("code")
        .rule_flags(flags::NO_BR_CHILD | flags::IGNORE_TAGS);
    builder
        .tag("hr")
        .rule_flags(flags::AUTO_CLOSE | flags::TRIM_BEFORE | flags::TRIM_AFTER);
    let schema = builder.build();

    let mut parser = Parser::new(schema);
    let regex = Regex::new(r"\[(/?)([A-Za-z]\w*)(?:=([^\]]*))?\]")?;
    parser.register_matcher("bbcode", Some("["), regex, |tags, text, matches| {
        for m in matches {
            let closing = m.groups[0].as_ref().is_some_and(|g| !g.is_empty());
            let Some(name_range) = m.groups[1].clone() else {
                continue;
            };
            let name = &text[name_range];
            if closing {
                tags.add_end_tag(name, m.range.start, m.range.len());
            } else {
                let tag = tags.add_start_tag(name, m.range.start, m.range.len());
                if let Some(value) = m.groups[2].clone() {
                    let value = text[value].to_string();
                    tags.set_attribute(tag, &name.to_ascii_lowercase(), &value);
                }
            }
        }
    });
    Ok(parser)
}
