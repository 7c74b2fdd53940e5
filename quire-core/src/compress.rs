//! Merging of adjacent steps before they go on the wire.
//!
//! Typing produces one insert per keystroke and holding backspace one delete
//! per char. Neighbouring steps of that shape collapse into a single replace;
//! applying the compressed list yields the same document.

use crate::model::{normalize_runs, Slice};
use crate::step::Step;

pub fn compress_steps(steps: &[Step]) -> Vec<Step> {
    let mut out: Vec<Step> = Vec::with_capacity(steps.len());
    for step in steps {
        if let Some(last) = out.last_mut() {
            if let Some(merged) = merge(last, step) {
                *last = merged;
                continue;
            }
        }
        out.push(step.clone());
    }
    out
}

fn merge(a: &Step, b: &Step) -> Option<Step> {
    let (
        Step::Replace {
            from: af,
            to: at,
            slice: Slice::Inline(ar),
        },
        Step::Replace {
            from: bf,
            to: bt,
            slice: Slice::Inline(br),
        },
    ) = (a, b)
    else {
        return None;
    };
    let a_size = Slice::Inline(ar.clone()).size();

    // Insert right after what `a` inserted.
    if bf == bt && *bf == af + a_size && !br.is_empty() {
        let mut runs = ar.clone();
        runs.extend(br.iter().cloned());
        return Some(Step::Replace {
            from: *af,
            to: *at,
            slice: Slice::Inline(normalize_runs(runs)),
        });
    }

    if ar.is_empty() && br.is_empty() {
        // Backspace: `b` deletes the range ending where `a` started.
        if bt == af {
            return Some(Step::delete(*bf, *at));
        }
        // Forward delete at the same position.
        if bf == af {
            return Some(Step::delete(*af, at + (bt - bf)));
        }
    }
    None
}
