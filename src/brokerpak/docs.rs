use std::fmt::Write as _;

use super::definition::ServiceDefinition;
use super::variables::BrokerVariable;

/// Render markdown documentation for a set of offerings.
pub fn render<'a>(services: impl IntoIterator<Item = &'a ServiceDefinition>) -> String {
    let mut out = String::from("# Service Offerings\n");
    for svc in services {
        // Writing to a String cannot fail.
        let _ = render_service(&mut out, svc);
    }
    out
}

fn render_service(out: &mut String, svc: &ServiceDefinition) -> std::fmt::Result {
    writeln!(out, "\n## {}\n", svc.display_name_or_name())?;
    if !svc.image_url.is_empty() {
        writeln!(out, "<img src=\"{}\" width=\"64\" alt=\"logo\">\n", svc.image_url)?;
    }
    writeln!(out, "{}\n", svc.description)?;
    writeln!(out, " * [Documentation]({})", svc.documentation_url)?;
    writeln!(out, " * [Support]({})", svc.support_url)?;
    writeln!(out, " * Catalog Metadata ID: `{}`", svc.id)?;
    writeln!(out, " * Tags: {}", svc.tags.join(", "))?;
    writeln!(out, " * Service Name: `{}`", svc.name)?;

    writeln!(out, "\n**Provision**\n")?;
    render_variables(out, &svc.provision.user_inputs)?;

    writeln!(out, "\n**Bind**\n")?;
    render_variables(out, &svc.bind.user_inputs)?;

    writeln!(out, "\n**Binding credentials**\n")?;
    render_variables(out, &svc.bind_output_variables())?;

    writeln!(out, "\n**Plans**\n")?;
    if svc.plans.is_empty() {
        writeln!(out, "_No plans available_")?;
    }
    for plan in &svc.plans {
        writeln!(out, " * **`{}`**: {} Plan ID: `{}`.", plan.name, plan.description, plan.id)?;
        if let Some(mi) = &plan.maintenance_info {
            writeln!(out, "    * Maintenance version: `{}`", mi.version)?;
        }
    }

    if !svc.examples.is_empty() {
        writeln!(out, "\n**Examples**\n")?;
    }
    for ex in &svc.examples {
        writeln!(out, "### {}\n\n{}", ex.name, ex.description)?;
        writeln!(out, "Uses plan: `{}`.\n", ex.plan_id)?;
        writeln!(
            out,
            "```javascript\n{}\n```",
            serde_json::to_string_pretty(&ex.provision_params).unwrap_or_default()
        )?;
    }
    Ok(())
}

fn render_variables(out: &mut String, vars: &[BrokerVariable]) -> std::fmt::Result {
    if vars.is_empty() {
        return writeln!(out, "_No parameters supported._");
    }
    for v in vars {
        write!(out, " * `{}` _{}_ - ", v.field_name, v.var_type)?;
        if v.required {
            write!(out, "**Required** ")?;
        }
        write!(out, "{}", v.details)?;
        if let Some(d) = &v.default {
            write!(out, " Default: `{d}`.")?;
        }
        writeln!(out)?;
        if !v.enum_values.is_empty() {
            writeln!(out, "    * The value must be one of:")?;
            for (value, label) in &v.enum_values {
                writeln!(out, "        * `{value}` - {label}")?;
            }
        }
    }
    Ok(())
}

impl ServiceDefinition {
    fn display_name_or_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}
