use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::SchoolIdentity;
use crate::error::{Result, ResultsError};
use crate::results::{SubjectResultView, TermResultView};

pub const CONTENT_TYPE: &str = "text/html; charset=utf-8";

pub const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{{studentName}} - {{term}} {{academicYear}}</title>
<style>
body { font-family: sans-serif; margin: 2em; }
table { border-collapse: collapse; width: 100%; }
th, td { border: 1px solid #999; padding: 4px 8px; text-align: left; }
.summary td { border: none; }
</style>
</head>
<body>
<header>
{{#logo}}<img src="{{logoUrl}}" alt="" height="64">{{/logo}}
<h1>{{schoolName}}</h1>
<p>{{schoolAddress}}</p>
<p><em>{{schoolMotto}}</em></p>
</header>
<h2>Report for {{term}}, {{academicYear}}</h2>
<table class="summary">
<tr><td>Student</td><td>{{studentName}}</td></tr>
<tr><td>Admission No.</td><td>{{admissionNo}}</td></tr>
<tr><td>Class</td><td>{{classroomId}}</td></tr>
</table>
<table>
<thead>
<tr><th>Subject</th><th>CA</th><th>Exam</th><th>Total</th><th>%</th><th>Grade</th>{{#positions}}<th>Position</th>{{/positions}}{{#statistics}}<th>Class Avg</th><th>Highest</th><th>Lowest</th>{{/statistics}}<th>Remarks</th></tr>
</thead>
<tbody>
{{#subjects}}<tr><td>{{subjectName}}</td><td>{{caScore}}/{{caMax}}</td><td>{{examScore}}/{{examMax}}</td><td>{{totalScore}}/{{totalPossible}}</td><td>{{percentage}}</td><td>{{grade}}</td>{{#positions}}<td>{{subjectPosition}}</td>{{/positions}}{{#statistics}}<td>{{classAverage}}</td><td>{{highest}}</td><td>{{lowest}}</td>{{/statistics}}<td>{{teacherRemarks}}</td></tr>
{{/subjects}}</tbody>
</table>
<table class="summary">
<tr><td>Total</td><td>{{totalMarks}} / {{totalPossible}}</td></tr>
<tr><td>Average</td><td>{{averagePercentage}}%</td></tr>
<tr><td>Overall Grade</td><td>{{overallGrade}}</td></tr>
<tr><td>GPA</td><td>{{gpa}}</td></tr>
{{#positions}}<tr><td>Position</td><td>{{classPosition}} of {{totalStudents}}</td></tr>{{/positions}}
</table>
<p>{{remarks}}</p>
<footer><small>Generated {{generatedAt}}</small></footer>
</body>
</html>
"#;

type Fields = BTreeMap<&'static str, String>;

/// Flattened values for one report: top-level fields plus named sections.
/// A section renders its body once per entry; an empty entry list hides it.
#[derive(Debug, Clone, Default)]
pub struct TemplateData {
    fields: Fields,
    sections: BTreeMap<&'static str, Vec<Fields>>,
}

#[derive(Debug, Clone)]
pub struct ReportInput {
    pub school: SchoolIdentity,
    pub term_result: TermResultView,
    pub subjects: Vec<SubjectResultView>,
    pub show_positions: bool,
    pub show_class_statistics: bool,
    pub decimal_places: u32,
    pub generated_at: String,
}

fn num(x: f64, dp: u32) -> String {
    format!("{:.*}", dp as usize, x)
}

/// 1 -> "1st", 12 -> "12th", 22 -> "22nd".
pub fn ordinal(n: i64) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

fn flag(on: bool) -> Vec<Fields> {
    if on {
        vec![Fields::new()]
    } else {
        Vec::new()
    }
}

impl TemplateData {
    pub fn from_report(input: &ReportInput) -> Self {
        let dp = input.decimal_places;
        let tr = &input.term_result;
        let mut fields = Fields::new();
        fields.insert("schoolName", input.school.name.clone());
        fields.insert("schoolAddress", input.school.address.clone());
        fields.insert("schoolMotto", input.school.motto.clone());
        fields.insert("logoUrl", input.school.logo_url.clone().unwrap_or_default());
        fields.insert("studentId", tr.student_id.clone());
        fields.insert("studentName", tr.student_name.clone());
        fields.insert("admissionNo", tr.admission_no.clone().unwrap_or_default());
        fields.insert("classroomId", tr.classroom_id.clone());
        fields.insert("term", tr.term.clone());
        fields.insert("academicYear", tr.academic_year.clone());
        fields.insert("totalMarks", num(tr.total_marks, dp));
        fields.insert("totalPossible", num(tr.total_possible, dp));
        fields.insert("averagePercentage", num(tr.average_percentage, dp));
        fields.insert("overallGrade", tr.overall_grade.clone());
        fields.insert("gpa", num(tr.gpa, dp));
        fields.insert("classPosition", ordinal(tr.rank_in_class));
        fields.insert("totalStudents", tr.total_students.to_string());
        fields.insert("remarks", tr.remarks.clone().unwrap_or_default());
        fields.insert("generatedAt", input.generated_at.clone());

        let subjects = input
            .subjects
            .iter()
            .map(|s| {
                let mut f = Fields::new();
                f.insert("subjectId", s.subject_id.clone());
                f.insert("subjectName", s.subject_name.clone());
                f.insert("subjectCode", s.subject_code.clone().unwrap_or_default());
                f.insert("caScore", num(s.ca_score, dp));
                f.insert("caMax", num(s.ca_max, dp));
                f.insert("examScore", num(s.exam_score, dp));
                f.insert("examMax", num(s.exam_max, dp));
                f.insert("totalScore", num(s.total_score, dp));
                f.insert("totalPossible", num(s.total_possible, dp));
                f.insert("percentage", num(s.percentage, dp));
                f.insert("grade", s.grade.clone());
                f.insert("point", num(s.point, dp));
                f.insert("subjectPosition", ordinal(s.rank_in_subject));
                f.insert("classAverage", num(s.class_average, dp));
                f.insert("highest", num(s.highest, dp));
                f.insert("lowest", num(s.lowest, dp));
                f.insert("teacherRemarks", s.teacher_remarks.clone().unwrap_or_default());
                f
            })
            .collect();

        let mut sections = BTreeMap::new();
        sections.insert("subjects", subjects);
        sections.insert("positions", flag(input.show_positions));
        sections.insert("statistics", flag(input.show_class_statistics));
        sections.insert("logo", flag(input.school.logo_url.is_some()));
        Self { fields, sections }
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn lookup<'a>(stack: &[&'a Fields], name: &str) -> Option<&'a String> {
    stack.iter().rev().find_map(|f| f.get(name))
}

fn render_block<'a>(
    tpl: &str,
    data: &'a TemplateData,
    stack: &mut Vec<&'a Fields>,
    out: &mut String,
) -> Result<()> {
    let mut rest = tpl;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| ResultsError::Render("unterminated placeholder".into()))?;
        let tag = after[..close].trim();
        rest = &after[close + 2..];

        if let Some(name) = tag.strip_prefix('#') {
            let end_tag = format!("{{{{/{}}}}}", name);
            let end = rest
                .find(&end_tag)
                .ok_or_else(|| ResultsError::Render(format!("section {} is not closed", name)))?;
            let body = &rest[..end];
            rest = &rest[end + end_tag.len()..];
            let entries = data
                .sections
                .get(name)
                .ok_or_else(|| ResultsError::Render(format!("unknown section {}", name)))?;
            for entry in entries {
                stack.push(entry);
                let res = render_block(body, data, stack, out);
                stack.pop();
                res?;
            }
        } else if let Some(name) = tag.strip_prefix('/') {
            return Err(ResultsError::Render(format!("unexpected closing tag {}", name)));
        } else {
            let value = lookup(stack, tag)
                .ok_or_else(|| ResultsError::Render(format!("unknown placeholder {}", tag)))?;
            out.push_str(&escape_html(value));
        }
    }
    out.push_str(rest);
    Ok(())
}

/// Fills `{{field}}` placeholders and `{{#section}}...{{/section}}` blocks.
/// Values are HTML-escaped. Unknown names are errors rather than blanks.
pub fn render(template: &str, data: &TemplateData) -> Result<String> {
    let mut out = String::with_capacity(template.len() * 2);
    let mut stack = vec![&data.fields];
    render_block(template, data, &mut stack, &mut out)?;
    Ok(out)
}

/// Runs `work` on its own thread and gives up after `timeout`. A timed-out
/// worker is left to finish on its own; its result is discarded.
pub fn run_with_timeout<T, F>(timeout: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("report-render".into())
        .spawn(move || {
            let _ = tx.send(work());
        })?;
    match rx.recv_timeout(timeout) {
        Ok(res) => res,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "report render timed out");
            Err(ResultsError::Render(format!(
                "rendering exceeded {} ms",
                timeout.as_millis()
            )))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(ResultsError::Render("renderer stopped without a result".into()))
        }
    }
}
