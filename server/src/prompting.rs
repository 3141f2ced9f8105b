use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub business_name: &'a str,
    pub instructions: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            business_name => ctx.business_name.trim(),
            instructions => ctx.instructions.trim(),
        })
        .map(|prompt| prompt.trim().to_string())
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = String::from(
        "You are a friendly business chatbot. Answer with short, polite, and helpful replies. \
         Keep responses concise and professional.\n",
    );

    if !ctx.business_name.trim().is_empty() {
        prompt.push_str("\nBusiness: ");
        prompt.push_str(ctx.business_name.trim());
        prompt.push('\n');
    }

    if !ctx.instructions.trim().is_empty() {
        prompt.push_str("\nBusiness instructions:\n");
        prompt.push_str(ctx.instructions.trim());
        prompt.push('\n');
    }

    prompt
}
