//! System prompt assembly for the Harvey agent

use crate::tools::schema::ToolDescriptor;

const PERSONA: &str = "You are H.A.R.V.E.Y., the Holistic Analysis and Regulation Virtual Expert \
for You. You answer SaaS pricing questions with data obtained through your tools, never from \
guesswork.";

const FILTER_RULES: &str = "\
Filter rules:\n\
- filters may only contain minPrice, maxPrice, features (string[]) and usageLimits \
(array of single-key objects mapping a usage limit name to a minimum threshold).\n\
- Price bounds are plain numbers in the pricing's base currency.\n\
- Feature and usage limit names must come from the pricing YAML (feature names and usage \
limit names). Fetch the document with iPricing first when you are unsure of the exact names.\n\
- For boolean usage limits use 1 to require the capability.\n\
- A usage limit key may name its unit in parentheses, e.g. {\"Seats (user)\": 200}; the \
unit must be the one declared in the YAML, values are never converted between units.\n\
- Use solver \"minizinc\" unless the user asks for another option.\n\
- Use objective \"minimize\" for cheapest/best requests and \"maximize\" for the most \
expensive option.";

/// Build the system prompt for one turn.
pub fn build_system_prompt(
    tools: &[&ToolDescriptor],
    pricing_urls: &[String],
    yaml_aliases: &[String],
    spec_excerpt: Option<&str>,
) -> String {
    let mut prompt = String::from(PERSONA);
    prompt.push_str("\n\nAvailable tools:\n");
    for descriptor in tools {
        prompt.push_str(&format!(
            "- {}: {} Returns {}.\n",
            descriptor.name, descriptor.description, descriptor.output_description
        ));
    }

    prompt.push('\n');
    prompt.push_str(FILTER_RULES);

    prompt.push_str("\n\nPricing context:\n");
    if pricing_urls.is_empty() && yaml_aliases.is_empty() {
        prompt.push_str("- none provided; ask the user for a pricing URL or YAML upload before \
                         calling tools that need one.\n");
    } else {
        for url in pricing_urls {
            prompt.push_str(&format!("- pricing URL: {url}\n"));
        }
        for alias in yaml_aliases {
            prompt.push_str(&format!(
                "- uploaded Pricing2Yaml available as pricing_url \"{alias}\"\n"
            ));
        }
        if pricing_urls.len() + yaml_aliases.len() > 1 {
            prompt.push_str(
                "Multiple pricing contexts exist; set pricing_url on every tool call to pick one.\n",
            );
        }
    }

    if let Some(excerpt) = spec_excerpt {
        prompt.push_str("\nPricing2Yaml specification excerpt:\n");
        prompt.push_str(excerpt);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nCall tools when the answer depends on pricing data. When you have everything you \
         need, reply with the final answer in plain language, citing plan names, costs and \
         configuration counts from the tool results.",
    );
    prompt
}

/// Whether the question warrants attaching the specification excerpt.
pub fn should_include_spec(question: &str) -> bool {
    let lowered = question.to_lowercase();
    ["pricing2yaml", "pricing 2 yaml", "yaml spec", "schema", "syntax", "ipricing"]
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ObjectSchema, SideEffect, ToolDescriptor};

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: "does things.".into(),
            input: ObjectSchema::new(),
            output_description: "{result}".into(),
            side_effect: SideEffect::Network,
        }
    }

    #[test]
    fn prompt_lists_tools_and_context() {
        let summary = descriptor("summary");
        let optimal = descriptor("optimal");
        let tools = vec![&summary, &optimal];
        let prompt = build_system_prompt(
            &tools,
            &["https://example.com/pricing".into()],
            &["uploaded://pricing".into()],
            None,
        );
        assert!(prompt.contains("- summary:"));
        assert!(prompt.contains("- optimal:"));
        assert!(prompt.contains("https://example.com/pricing"));
        assert!(prompt.contains("uploaded://pricing"));
        assert!(prompt.contains("Multiple pricing contexts"));
    }

    #[test]
    fn spec_excerpt_is_included_when_present() {
        let prompt = build_system_prompt(&[], &[], &[], Some("# Pricing2Yaml rules"));
        assert!(prompt.contains("# Pricing2Yaml rules"));
    }

    #[test]
    fn spec_trigger_matches_schema_questions() {
        assert!(should_include_spec("What does the Pricing2Yaml schema allow?"));
        assert!(should_include_spec("explain the YAML spec"));
        assert!(!should_include_spec("What is the cheapest plan with SSO?"));
    }
}
