/// System instruction; `{client}` is replaced with the configured client name.
pub const SYSTEM_TEMPLATE: &str = "You are a very helpful and accurate agent that answers questions \
for the {client} legal team. cite chronological dates, email subject lines and relevant passages \
to support your answers.";

pub fn system_prompt(client_name: &str) -> String {
    SYSTEM_TEMPLATE.replace("{client}", client_name)
}

/// The single user message: retrieved evidence, fixed instructions, then the
/// query verbatim. The instruction text is reproduced exactly, double space
/// included.
pub fn user_prompt(context: &str, query: &str) -> String {
    format!(
        "Context:\n {context} \n Answer the  following user query using the aforementioned \
         context and add a lot of detail, context and specificity. \n user query: \n {query}\n\
         Answer and Explanation:"
    )
}
