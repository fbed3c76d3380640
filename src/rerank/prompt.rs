//! Instruction template for the rerank call.

use super::result::{RerankResult, MAX_MATCHES};

pub const PRODUCT_LIST_OPEN: &str = "<product-list>";
pub const PRODUCT_LIST_CLOSE: &str = "</product-list>";
pub const TARGET_OPEN: &str = "<target-product>";
pub const TARGET_CLOSE: &str = "</target-product>";

const INSTRUCTIONS: &str = "\
Given a list of products and a target product, find the most similar products in the list.
IMPORTANT: weigh the aspects that matter most to a customer looking for an equivalent product.
If more than one product is equally relevant and of high quality, return AT MOST THE {max} BEST.
If no product is relevant enough, return an empty \"matches\" list.
Copy each itemName exactly as it appears in the product list. similarity is a number from 0 to 1.

Answer with a single JSON object and nothing else, following this schema:
{schema}";

/// Assemble the full prompt for one target and its candidate names.
pub fn build_prompt(target: &str, candidates: &[String]) -> String {
    let schema = serde_json::to_string_pretty(&RerankResult::schema()).unwrap_or_default();
    let instructions = INSTRUCTIONS
        .replace("{max}", &MAX_MATCHES.to_string())
        .replace("{schema}", &schema);

    let product_list = candidates
        .iter()
        .map(|name| format!("- {}", single_line(name)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{instructions}\n\n{PRODUCT_LIST_OPEN}\n{product_list}\n{PRODUCT_LIST_CLOSE}\n\n{TARGET_OPEN}\n{}\n{TARGET_CLOSE}\n",
        single_line(target)
    )
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
