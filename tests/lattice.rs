use ebpf_absint::context::AnalysisContext;
use ebpf_absint::ebpf_domain::EbpfDomain;
use ebpf_absint::linear::{le, LinearExpression};
use ebpf_absint::split_dbm::SplitDbm;

const STATES: &[&[&str]] = &[
    &["r0.type=number", "r0.svalue=0"],
    &["r0.type=number", "r0.svalue=[0, 10]"],
    &["r0.type=number", "r0.svalue=[5, +oo]", "r1.type=ctx", "r1.ctx_offset=0"],
    &["r1.type=stack", "r1.stack_offset=4088", "s[4088...4095].type=number"],
    &["r1.type=packet", "r1.packet_offset=[0, 4]", "r2.svalue-r1.svalue<=4"],
    &["r0.type in {number, stack}", "r0.svalue=[1, 2]"],
    &[],
];

fn states(ctx: &AnalysisContext) -> Vec<EbpfDomain> {
    let mut all: Vec<EbpfDomain> = STATES
        .iter()
        .map(|facts| EbpfDomain::from_constraints(ctx, facts).unwrap())
        .collect();
    all.push(EbpfDomain::bottom());
    all.push(EbpfDomain::setup_entry(ctx));
    all
}

#[test]
fn test_join_is_an_upper_bound() {
    let ctx = AnalysisContext::default();
    let all = states(&ctx);
    for a in &all {
        for b in &all {
            let j = a.join(&ctx, b);
            assert!(a.le(&j), "{} !<= {}", a.render(&ctx), j.render(&ctx));
            assert!(b.le(&j), "{} !<= {}", b.render(&ctx), j.render(&ctx));
            assert!(j.is_bottom() || j.inv.dbm().is_closed(), "{}", j.render(&ctx));
        }
    }
}

#[test]
fn test_join_is_idempotent() {
    let ctx = AnalysisContext::default();
    for a in states(&ctx) {
        let j = a.join(&ctx, &a);
        assert!(j.le(&a) && a.le(&j), "{}", a.render(&ctx));
    }
}

#[test]
fn test_meet_is_a_lower_bound() {
    let ctx = AnalysisContext::default();
    let all = states(&ctx);
    for a in &all {
        for b in &all {
            let m = a.meet(b);
            assert!(m.le(a) && m.le(b));
        }
    }
}

#[test]
fn test_widen_is_an_upper_bound() {
    let ctx = AnalysisContext::default();
    let all = states(&ctx);
    for a in &all {
        for b in &all {
            let w = a.widen(b);
            assert!(a.le(&w) && b.le(&w));
        }
    }
}

#[test]
fn test_bottom_and_top() {
    let ctx = AnalysisContext::default();
    for a in states(&ctx) {
        assert!(EbpfDomain::bottom().le(&a));
        assert!(a.le(&EbpfDomain::top()));
    }
}

#[test]
fn test_closure_is_a_fixpoint() {
    let ctx = AnalysisContext::default();
    let x = ctx.vars().parse("r1.svalue").unwrap();
    let y = ctx.vars().parse("r2.svalue").unwrap();
    let z = ctx.vars().parse("r3.svalue").unwrap();

    let mut d = SplitDbm::top();
    d.add_constraint(&le(LinearExpression::variable(x), LinearExpression::variable(y) + 1i64));
    d.add_constraint(&le(LinearExpression::variable(y), LinearExpression::variable(z) + 2i64));
    d.add_constraint(&le(z, 5i64));

    let mut once = d.clone();
    once.normalize();
    let mut twice = once.clone();
    twice.normalize();
    assert!(once.is_closed());
    assert_eq!(once.relations(), twice.relations());
    assert_eq!(once.intervals(), twice.intervals());
}
