use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;
use std::sync::Arc;

/// Annotation selecting a class before `spec.ingressClassName` existed.
const LEGACY_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const DEFAULT_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

pub trait IngressClassExt {
    fn controller_name(&self) -> Option<&String>;
    fn is_default(&self) -> bool;
}

pub trait IngressExt {
    fn ingress_class_name(&self) -> Option<&String>;
}

impl IngressClassExt for IngressClass {
    fn controller_name(&self) -> Option<&String> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.controller.as_ref())
    }

    fn is_default(&self) -> bool {
        self.annotations()
            .get(DEFAULT_CLASS_ANNOTATION)
            .is_some_and(|value| value == "true")
    }
}

impl IngressExt for Ingress {
    fn ingress_class_name(&self) -> Option<&String> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.ingress_class_name.as_ref())
            .or_else(|| self.annotations().get(LEGACY_CLASS_ANNOTATION))
    }
}

/// Decides which ingresses this controller serves.
#[derive(Debug, Clone)]
pub struct ClassFilter {
    pub ingress_class_name: String,
    pub controller_class_name: String,
}

impl ClassFilter {
    /// True when the ingress names our class directly, or names an ingress class handled by
    /// our controller. A classless ingress is ours unless the cluster's default ingress class
    /// belongs to another controller.
    pub fn matches(&self, ingress: &Ingress, ingress_classes: &[Arc<IngressClass>]) -> bool {
        let Some(class_name) = ingress.ingress_class_name() else {
            let mut defaults = ingress_classes
                .iter()
                .filter(|ingress_class| ingress_class.is_default())
                .peekable();
            return defaults.peek().is_none()
                || defaults.any(|ingress_class| self.owns(ingress_class));
        };

        if *class_name == self.ingress_class_name {
            return true;
        }

        ingress_classes
            .iter()
            .any(|ingress_class| ingress_class.name_any() == *class_name && self.owns(ingress_class))
    }

    fn owns(&self, ingress_class: &IngressClass) -> bool {
        ingress_class.name_any() == self.ingress_class_name
            || ingress_class
                .controller_name()
                .is_some_and(|controller| *controller == self.controller_class_name)
    }
}
